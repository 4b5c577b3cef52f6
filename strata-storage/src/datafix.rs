//! Versioned upgrades of stored tags.

use fastnbt::Value;
use log::debug;

/// Which kind of stored document a tag is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFixType {
    Chunk,
    EntityChunk,
    PoiChunk,
}

pub trait DataFixer: Send + Sync {
    /// Brings `tag` from `from_version` up to `to_version`.
    fn update(
        &self,
        fix_type: DataFixType,
        tag: Value,
        from_version: i32,
        to_version: i32,
    ) -> Value;
}

/// Leaves every tag untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFixer;

impl DataFixer for NoopFixer {
    fn update(&self, _fix_type: DataFixType, tag: Value, _from: i32, _to: i32) -> Value {
        tag
    }
}

type FixFn = Box<dyn Fn(Value) -> Value + Send + Sync>;

struct FixStep {
    fix_type: DataFixType,
    version: i32,
    apply: FixFn,
}

/// Ordered schema steps. A step tagged with version `v` runs for an update
/// `from -> to` when `from < v <= to`.
#[derive(Default)]
pub struct FixerChain {
    steps: Vec<FixStep>,
}

impl FixerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(
        mut self,
        fix_type: DataFixType,
        version: i32,
        apply: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        let at = self.steps.partition_point(|step| step.version <= version);
        self.steps.insert(at, FixStep { fix_type, version, apply: Box::new(apply) });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl DataFixer for FixerChain {
    fn update(
        &self,
        fix_type: DataFixType,
        mut tag: Value,
        from_version: i32,
        to_version: i32,
    ) -> Value {
        for step in &self.steps {
            if step.fix_type == fix_type
                && from_version < step.version
                && step.version <= to_version
            {
                debug!("Applying {fix_type:?} fix {} (from {from_version})", step.version);
                tag = (step.apply)(tag);
            }
        }
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag;

    fn append(marker: &'static str) -> impl Fn(Value) -> Value + Send + Sync {
        move |mut value| {
            let trail = match tag::get(&value, "trail") {
                Some(Value::String(s)) => format!("{s}{marker}"),
                _ => marker.to_string(),
            };
            tag::put(&mut value, "trail", Value::String(trail));
            value
        }
    }

    fn trail(value: &Value) -> Option<&str> {
        match tag::get(value, "trail") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    #[test]
    fn test_steps_run_in_version_order_within_range() {
        let chain = FixerChain::new()
            .with_step(DataFixType::Chunk, 300, append("c"))
            .with_step(DataFixType::Chunk, 100, append("a"))
            .with_step(DataFixType::Chunk, 200, append("b"))
            .with_step(DataFixType::EntityChunk, 150, append("x"));
        assert_eq!(chain.len(), 4);

        let all = chain.update(DataFixType::Chunk, tag::compound([]), 0, 300);
        assert_eq!(trail(&all), Some("abc"));

        let partial = chain.update(DataFixType::Chunk, tag::compound([]), 100, 200);
        assert_eq!(trail(&partial), Some("b"));

        let none = chain.update(DataFixType::Chunk, tag::compound([]), 300, 300);
        assert_eq!(trail(&none), None);

        let entities = chain.update(DataFixType::EntityChunk, tag::compound([]), -1, 300);
        assert_eq!(trail(&entities), Some("x"));
    }

    #[test]
    fn test_noop() {
        let value = tag::compound([("a", Value::Int(1))]);
        assert_eq!(NoopFixer.update(DataFixType::PoiChunk, value.clone(), 1, 2730), value);
    }
}

//! Small helpers over `fastnbt::Value` trees.

use std::collections::HashMap;

use fastnbt::Value;

pub const DATA_VERSION_KEY: &str = "DataVersion";

pub fn compound<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    Value::Compound(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<HashMap<_, _>>(),
    )
}

pub fn get<'a>(tag: &'a Value, key: &str) -> Option<&'a Value> {
    match tag {
        Value::Compound(map) => map.get(key),
        _ => None,
    }
}

/// Reads any numeric tag as an int.
pub fn get_int(tag: &Value, key: &str) -> Option<i32> {
    match get(tag, key)? {
        Value::Byte(v) => Some(*v as i32),
        Value::Short(v) => Some(*v as i32),
        Value::Int(v) => Some(*v),
        Value::Long(v) => Some(*v as i32),
        _ => None,
    }
}

/// Inserts `value` if `tag` is a compound; other tags are left alone.
pub fn put(tag: &mut Value, key: &str, value: Value) {
    if let Value::Compound(map) = tag {
        map.insert(key.to_string(), value);
    }
}

pub fn data_version(tag: &Value) -> Option<i32> {
    get_int(tag, DATA_VERSION_KEY)
}

pub fn set_data_version(tag: &mut Value, version: i32) {
    put(tag, DATA_VERSION_KEY, Value::Int(version));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_tags_read_as_int() {
        let tag = compound([
            ("a", Value::Byte(3)),
            ("b", Value::Short(-2)),
            ("c", Value::Int(2730)),
            ("d", Value::String("x".to_string())),
        ]);
        assert_eq!(get_int(&tag, "a"), Some(3));
        assert_eq!(get_int(&tag, "b"), Some(-2));
        assert_eq!(get_int(&tag, "c"), Some(2730));
        assert_eq!(get_int(&tag, "d"), None);
        assert_eq!(get_int(&tag, "missing"), None);
        assert_eq!(get_int(&Value::Int(1), "a"), None);
    }

    #[test]
    fn test_set_data_version() {
        let mut tag = compound([]);
        assert_eq!(data_version(&tag), None);
        set_data_version(&mut tag, 2730);
        assert_eq!(data_version(&tag), Some(2730));

        let mut not_compound = Value::Int(0);
        set_data_version(&mut not_compound, 1);
        assert_eq!(not_compound, Value::Int(0));
    }
}

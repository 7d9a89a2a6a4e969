//! `tf.train.Example` protobuf messages.

use std::collections::BTreeMap;

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
    pub kind: Option<feature::Kind>,
}

pub mod feature {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        BytesList(super::BytesList),
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
        #[prost(message, tag = "3")]
        Int64List(super::Int64List),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Features {
    #[prost(btree_map = "string, message", tag = "1")]
    pub feature: BTreeMap<String, Feature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Example {
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

impl Feature {
    #[must_use]
    pub fn bytes(values: Vec<Vec<u8>>) -> Self {
        Self {
            kind: Some(feature::Kind::BytesList(BytesList { value: values })),
        }
    }

    #[must_use]
    pub fn floats(values: Vec<f32>) -> Self {
        Self {
            kind: Some(feature::Kind::FloatList(FloatList { value: values })),
        }
    }

    #[must_use]
    pub fn int64s(values: Vec<i64>) -> Self {
        Self {
            kind: Some(feature::Kind::Int64List(Int64List { value: values })),
        }
    }
}

impl Example {
    #[must_use]
    pub fn new(feature: BTreeMap<String, Feature>) -> Self {
        Self {
            features: Some(Features { feature }),
        }
    }

    fn kind(&self, key: &str) -> Option<&feature::Kind> {
        self.features.as_ref()?.feature.get(key)?.kind.as_ref()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.features
            .as_ref()
            .map(|f| f.feature.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn bytes(&self, key: &str) -> Option<&[Vec<u8>]> {
        match self.kind(key)? {
            feature::Kind::BytesList(list) => Some(&list.value),
            _ => None,
        }
    }

    #[must_use]
    pub fn floats(&self, key: &str) -> Option<&[f32]> {
        match self.kind(key)? {
            feature::Kind::FloatList(list) => Some(&list.value),
            _ => None,
        }
    }

    #[must_use]
    pub fn int64s(&self, key: &str) -> Option<&[i64]> {
        match self.kind(key)? {
            feature::Kind::Int64List(list) => Some(&list.value),
            _ => None,
        }
    }

    /// First element of a bytes feature, as UTF-8.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<String> {
        self.bytes(key)?
            .first()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_wire_round_trip() {
        let mut features = BTreeMap::new();
        features.insert("a".to_string(), Feature::int64s(vec![1, -2, 3]));
        features.insert("b".to_string(), Feature::floats(vec![0.5]));
        features.insert("c".to_string(), Feature::bytes(vec![b"x".to_vec()]));
        let example = Example::new(features);

        let decoded = Example::decode(example.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, example);
        assert_eq!(decoded.int64s("a"), Some(&[1, -2, 3][..]));
        assert_eq!(decoded.text("c").as_deref(), Some("x"));
        assert!(decoded.floats("a").is_none());
        assert_eq!(decoded.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_wire_matches_tensorflow_layout() {
        // Features{feature: {"k": Feature{int64_list: [1]}}}
        let mut features = BTreeMap::new();
        features.insert("k".to_string(), Feature::int64s(vec![1]));
        let bytes = Example::new(features).encode_to_vec();
        assert_eq!(
            bytes,
            vec![0x0A, 0x0C, 0x0A, 0x0A, 0x0A, 0x01, b'k', 0x12, 0x05, 0x1A, 0x03, 0x0A, 0x01, 0x01]
        );
    }
}

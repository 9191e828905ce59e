use crate::artifact::{Text, Value, downcast_ref};
use std::sync::Arc;

pub fn text(value: &str) -> Value {
    Value::Artifact(Arc::new(Text::new(value)))
}

pub fn text_of(value: Option<Value>) -> Option<String> {
    let artifact = value?.into_artifact()?;
    downcast_ref::<Text>(&artifact).map(|text| text.as_str().to_string())
}

/// Runs the contract every [Backend](crate::backend::Backend) has to fulfill against the value
/// returned by `$constructor`.
#[macro_export]
macro_rules! test_backend {
    ($mod_name:ident, $constructor:expr) => {
        mod $mod_name {
            use super::*;
            use $crate::backend::Backend;
            use $crate::backend::tests::{text, text_of};
            use $crate::descriptor::Descriptor;

            #[test]
            fn test_get_returns_none_for_unknown_descriptor() {
                let backend = $constructor;
                let desc = Descriptor::new("Text", "unknown");
                assert!(backend.get(&desc).unwrap().is_none());
                assert!(!backend.contains(&desc).unwrap());
                assert!(backend.get_raw(&desc).unwrap().is_none());
            }

            #[test]
            fn test_can_get_value_that_was_put() {
                let backend = $constructor;
                let desc = Descriptor::new("Text", "greeting").with_tag("t");
                backend.put(&desc, text("hello")).unwrap();
                assert_eq!(text_of(backend.get(&desc).unwrap()).as_deref(), Some("hello"));
                assert!(backend.contains(&desc).unwrap());
            }

            #[test]
            fn test_different_descriptors_are_separate() {
                let backend = $constructor;
                let a = Descriptor::new("Text", "a");
                let b = Descriptor::new("Text", "b");
                backend.put(&a, text("Hello, a!")).unwrap();
                backend.put(&b, text("Hello, b!")).unwrap();
                assert_eq!(text_of(backend.get(&a).unwrap()).as_deref(), Some("Hello, a!"));
                assert_eq!(text_of(backend.get(&b).unwrap()).as_deref(), Some("Hello, b!"));
            }

            #[test]
            fn test_can_overwrite_value() {
                let backend = $constructor;
                let desc = Descriptor::new("Text", "x");
                backend.put(&desc, text("first")).unwrap();
                backend.put(&desc, text("second")).unwrap();
                assert_eq!(text_of(backend.get(&desc).unwrap()).as_deref(), Some("second"));
            }

            #[test]
            fn test_remove_makes_value_absent() {
                let backend = $constructor;
                let desc = Descriptor::new("Text", "x");
                backend.put(&desc, text("doomed")).unwrap();
                backend.remove(&desc).unwrap();
                assert!(backend.get(&desc).unwrap().is_none());
                assert!(!backend.contains(&desc).unwrap());
            }

            #[test]
            fn test_remove_of_unknown_descriptor_succeeds() {
                let backend = $constructor;
                backend.remove(&Descriptor::new("Text", "never-stored")).unwrap();
            }

            #[test]
            fn test_load_keys_finds_matching_descriptors() {
                let backend = $constructor;
                backend.put(&Descriptor::new("Text", "a").with_tag("t"), text("a")).unwrap();
                backend.put(&Descriptor::new("Text", "b").with_tag("t"), text("b")).unwrap();
                backend.put(&Descriptor::new("Text", "c").with_tag("other"), text("c")).unwrap();
                backend.flush().unwrap();
                let mut ids: Vec<_> = backend
                    .load_keys(&Descriptor::new("Text", "").with_tag("t"))
                    .unwrap()
                    .into_iter()
                    .map(|desc| desc.id().to_string())
                    .collect();
                ids.sort();
                assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
            }

            #[test]
            fn test_metadata_exists_after_flushed_put() {
                let backend = $constructor;
                let desc = Descriptor::new("Text", "x");
                backend.put(&desc, text("x")).unwrap();
                backend.flush().unwrap();
                let meta = backend.get_metadata(&desc).unwrap().unwrap();
                assert_eq!(meta.descriptor, desc);
                assert!(meta.write_time.is_some());
            }
        }
    };
}

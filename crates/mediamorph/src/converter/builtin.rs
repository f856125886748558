//! Registration of built-in converters by name.

use std::sync::Arc;

use log::{info, warn};

use super::jpeg2heic::Jpeg2HeicConverter;
use super::ConverterRegistry;

/// Names of all built-in converters this binary ships.
pub fn available_builtin_converters() -> &'static [&'static str] {
    &["jpeg2heic"]
}

/// Registers the requested built-in converters. Unknown names are logged
/// and skipped; an empty list registers nothing. Returns the number of
/// converters registered.
pub fn register_builtin_converters(registry: &ConverterRegistry, names: &[String]) -> usize {
    let mut registered = 0;

    for raw in names {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }

        match name.to_lowercase().as_str() {
            "jpeg2heic" => {
                registry.register(Arc::new(Jpeg2HeicConverter::new()));
                info!("registered builtin converter: jpeg2heic");
                registered += 1;
            }
            other => {
                warn!("unknown builtin converter '{other}', skipping");
            }
        }
    }

    registered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_known_converter() {
        let registry = ConverterRegistry::new();
        let count = register_builtin_converters(&registry, &["jpeg2heic".to_string()]);

        assert_eq!(count, 1);
        assert!(registry.get("jpeg2heic").is_some());
    }

    #[test]
    fn test_unknown_names_are_skipped() {
        let registry = ConverterRegistry::new();
        let count = register_builtin_converters(
            &registry,
            &["jpeg2heic".to_string(), "png2avif".to_string()],
        );

        assert_eq!(count, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_list_registers_nothing() {
        let registry = ConverterRegistry::new();
        assert_eq!(register_builtin_converters(&registry, &[]), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_are_case_insensitive_and_trimmed() {
        let registry = ConverterRegistry::new();
        let count = register_builtin_converters(&registry, &[" JPEG2HEIC ".to_string()]);

        assert_eq!(count, 1);
        assert!(registry.get("jpeg2heic").is_some());
    }

    #[test]
    fn test_available_list_contains_jpeg2heic() {
        assert!(available_builtin_converters().contains(&"jpeg2heic"));
    }
}

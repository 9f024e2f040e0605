// Helper functions for extracting values from KDL nodes

use flowline_core::job::Vars;
use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Read a non-negative integer property, rejecting anything out of range.
pub(crate) fn get_uint_prop(node: &KdlNode, name: &str, max: u64) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let field = format!("{} {}", node.name().value(), name);
    let number = value.as_integer().ok_or_else(|| ConfigError::InvalidValue {
        field: field.clone(),
        message: format!("expected an integer, got {}", value),
    })?;
    match u64::try_from(number) {
        Ok(n) if n <= max => Ok(Some(n)),
        _ => Err(ConfigError::InvalidValue {
            field,
            message: format!("{} is out of range 0..={}", number, max),
        }),
    }
}

/// Collect `key "value"` children into an ordered variable map.
pub(crate) fn get_vars(node: &KdlNode) -> Vars {
    let mut vars = Vars::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                vars.insert(key, val);
            }
        }
    }
    vars
}

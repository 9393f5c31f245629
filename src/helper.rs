//! Type resolution helpers used to label traced calls
//!
//! Stateless lookups over an [`ObjectSpace`]. The only rules that matter:
//! metatypes collapse onto the type they were synthesized for, and display
//! names prefer the constant name over the dynamic `name` method.

use crate::error::{Result, TraceError};
use crate::host::{ModuleRef, ObjectSpace, Value};

/// True if the value is a module, class or metatype
pub fn is_module_like(space: &ObjectSpace, value: Value) -> bool {
    space.is_module(value)
}

/// True if the value is an instantiable type (a strict subset of module-like)
pub fn is_class_like(space: &ObjectSpace, value: Value) -> bool {
    space.is_class(value)
}

/// Collapse a metatype onto the type it belongs to
///
/// The metatype of a module resolves to the module itself; the metatype of a
/// plain object resolves to that object's class. Anything else is returned
/// unchanged.
pub fn resolve_singleton_class(space: &ObjectSpace, module: ModuleRef) -> ModuleRef {
    let mut current = module;
    while let Some(attached) = space.attached(current) {
        current = match attached {
            Value::Module(owner) => owner,
            Value::Object(object) => space.real_class(object),
        };
    }
    current
}

/// Canonical type owning a value, used as the call's source label
pub fn resolve_owning_type(space: &ObjectSpace, value: Value) -> ModuleRef {
    match value {
        Value::Module(module) => resolve_singleton_class(space, module),
        Value::Object(object) => resolve_singleton_class(space, space.real_class(object)),
    }
}

/// Display name of a resolved type
///
/// Falls back to the dynamic `name` method when the type has no constant name
/// (anonymous classes that still answer to `name`).
pub fn normalize_display_name(space: &ObjectSpace, module: ModuleRef) -> Option<String> {
    space
        .const_name(module)
        .or_else(|| space.name(module))
        .map(str::to_string)
}

/// Resolve a constant name such as `"A::B"`
pub fn constantize(space: &ObjectSpace, name: &str) -> Result<ModuleRef> {
    let name = name.strip_prefix("::").unwrap_or(name);
    space
        .lookup_const(name)
        .ok_or_else(|| TraceError::UnknownConstant(name.to_string()))
}

//! Host object model of the traced engine
//!
//! Mirrors the parts of a class-based object model that call labeling needs:
//! modules, classes with a superclass chain, per-object metatypes (singleton
//! classes) and plain objects. Every module and class gets its metatype at
//! definition time; objects get one only on request.

use std::collections::HashMap;
use std::fmt;

/// Handle to a module, class or metatype in an [`ObjectSpace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleRef(u32);

/// Handle to a plain object in an [`ObjectSpace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(u32);

/// Any value a method can be invoked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Module(ModuleRef),
    Object(ObjectRef),
}

impl From<ModuleRef> for Value {
    fn from(module: ModuleRef) -> Self {
        Value::Module(module)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleKind {
    Module,
    Class { superclass: Option<ModuleRef> },
    Metatype { attached: Value },
}

#[derive(Debug, Clone)]
struct ModuleEntry {
    kind: ModuleKind,
    /// Constant name, `None` for anonymous modules
    const_name: Option<String>,
    /// Result of a redefined `name` method; `Some(None)` models a `nil` override
    name_override: Option<Option<String>>,
    /// File the constant was defined in
    source_path: Option<String>,
    metatype: Option<ModuleRef>,
}

#[derive(Debug, Clone)]
struct ObjectEntry {
    class: ModuleRef,
    metatype: Option<ModuleRef>,
}

/// Registry of every module, class, metatype and object known to the engine
#[derive(Debug, Clone)]
pub struct ObjectSpace {
    modules: Vec<ModuleEntry>,
    objects: Vec<ObjectEntry>,
    constants: HashMap<String, ModuleRef>,
    object_class: ModuleRef,
}

impl Default for ObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectSpace {
    /// Create a space containing only the root `Object` class
    pub fn new() -> Self {
        let mut space = Self {
            modules: Vec::new(),
            objects: Vec::new(),
            constants: HashMap::new(),
            object_class: ModuleRef(0),
        };
        space.object_class = space.insert_module(
            ModuleKind::Class { superclass: None },
            Some("Object".to_string()),
        );
        space
    }

    /// The root class
    pub fn object_class(&self) -> ModuleRef {
        self.object_class
    }

    pub fn define_module(&mut self, name: &str) -> ModuleRef {
        self.insert_module(ModuleKind::Module, Some(name.to_string()))
    }

    /// Define a named class; `None` superclass means `Object`
    pub fn define_class(&mut self, name: &str, superclass: Option<ModuleRef>) -> ModuleRef {
        let superclass = Some(superclass.unwrap_or(self.object_class));
        self.insert_module(ModuleKind::Class { superclass }, Some(name.to_string()))
    }

    /// Define a class that is not bound to any constant
    pub fn anonymous_class(&mut self, superclass: Option<ModuleRef>) -> ModuleRef {
        let superclass = Some(superclass.unwrap_or(self.object_class));
        self.insert_module(ModuleKind::Class { superclass }, None)
    }

    pub fn anonymous_module(&mut self) -> ModuleRef {
        self.insert_module(ModuleKind::Module, None)
    }

    fn insert_module(&mut self, kind: ModuleKind, const_name: Option<String>) -> ModuleRef {
        let module = self.push_entry(kind, const_name.clone());
        let metatype = self.push_entry(
            ModuleKind::Metatype {
                attached: Value::Module(module),
            },
            None,
        );
        self.modules[module.0 as usize].metatype = Some(metatype);
        if let Some(name) = const_name {
            self.constants.insert(name, module);
        }
        module
    }

    fn push_entry(&mut self, kind: ModuleKind, const_name: Option<String>) -> ModuleRef {
        let module = ModuleRef(self.modules.len() as u32);
        self.modules.push(ModuleEntry {
            kind,
            const_name,
            name_override: None,
            source_path: None,
            metatype: None,
        });
        module
    }

    fn entry(&self, module: ModuleRef) -> &ModuleEntry {
        &self.modules[module.0 as usize]
    }

    /// Record the file a constant was defined in
    pub fn set_source_path(&mut self, module: ModuleRef, path: impl Into<String>) {
        self.modules[module.0 as usize].source_path = Some(path.into());
    }

    /// Redefine the module's `name` method; `None` makes it return nil
    pub fn override_name(&mut self, module: ModuleRef, name: Option<String>) {
        self.modules[module.0 as usize].name_override = Some(name);
    }

    /// Create an instance of `class`
    pub fn allocate(&mut self, class: ModuleRef) -> ObjectRef {
        let object = ObjectRef(self.objects.len() as u32);
        self.objects.push(ObjectEntry {
            class,
            metatype: None,
        });
        object
    }

    /// The metatype of a value, creating it for objects on first use
    pub fn singleton_class_of(&mut self, value: Value) -> ModuleRef {
        match value {
            Value::Module(module) => match self.entry(module).metatype {
                Some(metatype) => metatype,
                None => {
                    let metatype = self.push_entry(ModuleKind::Metatype { attached: value }, None);
                    self.modules[module.0 as usize].metatype = Some(metatype);
                    metatype
                }
            },
            Value::Object(object) => match self.objects[object.0 as usize].metatype {
                Some(metatype) => metatype,
                None => {
                    let metatype = self.push_entry(ModuleKind::Metatype { attached: value }, None);
                    self.objects[object.0 as usize].metatype = Some(metatype);
                    metatype
                }
            },
        }
    }

    /// The class an object was instantiated from, ignoring any metatype
    pub fn real_class(&self, object: ObjectRef) -> ModuleRef {
        self.objects[object.0 as usize].class
    }

    /// The type that method lookup starts from: the metatype if one exists
    pub fn lookup_class(&self, value: Value) -> ModuleRef {
        match value {
            Value::Module(module) => self.entry(module).metatype.unwrap_or(module),
            Value::Object(object) => {
                let entry = &self.objects[object.0 as usize];
                entry.metatype.unwrap_or(entry.class)
            }
        }
    }

    /// True for modules, classes and metatypes
    pub fn is_module(&self, value: Value) -> bool {
        matches!(value, Value::Module(_))
    }

    /// True for classes and metatypes
    pub fn is_class(&self, value: Value) -> bool {
        match value {
            Value::Module(module) => !matches!(self.entry(module).kind, ModuleKind::Module),
            Value::Object(_) => false,
        }
    }

    pub fn is_metatype(&self, module: ModuleRef) -> bool {
        matches!(self.entry(module).kind, ModuleKind::Metatype { .. })
    }

    /// The value a metatype was synthesized for
    pub fn attached(&self, module: ModuleRef) -> Option<Value> {
        match self.entry(module).kind {
            ModuleKind::Metatype { attached } => Some(attached),
            _ => None,
        }
    }

    /// Superclass of a class; modules and metatypes have none
    pub fn superclass(&self, module: ModuleRef) -> Option<ModuleRef> {
        match self.entry(module).kind {
            ModuleKind::Class { superclass } => superclass,
            _ => None,
        }
    }

    /// Name the module was bound to as a constant
    pub fn const_name(&self, module: ModuleRef) -> Option<&str> {
        self.entry(module).const_name.as_deref()
    }

    /// Result of calling the module's `name` method
    pub fn name(&self, module: ModuleRef) -> Option<&str> {
        match &self.entry(module).name_override {
            Some(name) => name.as_deref(),
            None => self.const_name(module),
        }
    }

    /// File the module's constant was defined in
    pub fn source_path(&self, module: ModuleRef) -> Option<&str> {
        self.entry(module).source_path.as_deref()
    }

    pub fn lookup_const(&self, name: &str) -> Option<ModuleRef> {
        self.constants.get(name).copied()
    }

    /// Human readable label used in log output
    pub fn inspect(&self, value: Value) -> String {
        match value {
            Value::Module(module) => match (self.const_name(module), self.attached(module)) {
                (Some(name), _) => name.to_string(),
                (None, Some(attached)) => format!("#<Class:{}>", self.inspect(attached)),
                (None, None) => format!("#<anonymous {}>", module),
            },
            Value::Object(object) => {
                format!("#<{} {}>", self.inspect(Value::Module(self.real_class(object))), object)
            }
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

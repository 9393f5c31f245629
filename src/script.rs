//! JSON program scripts replayed on the reference [`Engine`]
//!
//! A program declares modules and classes, then a tree of calls. Installing
//! it defines the types in the engine's object space and resolves every
//! name; running it replays the calls as nested invocations.
//!
//! ```json
//! {
//!   "modules": [
//!     { "name": "A", "kind": "module", "path": "/app/a.rb" },
//!     { "name": "B", "superclass": "Base" }
//!   ],
//!   "calls": [
//!     { "receiver": "A", "method": "call_b", "caller": "/app/main.rb:2",
//!       "calls": [ { "receiver": "B", "instance": true, "method": "call" } ] }
//!   ]
//! }
//! ```

use crate::engine::Engine;
use crate::error::Result as TraceResult;
use crate::event::{EventKind, Location};
use crate::host::{ModuleRef, Value};
use crate::source::{CallSite, EventSource};
use anyhow::{bail, Context, Result};
use fnv::FnvHashMap;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclKind {
    Module,
    #[default]
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDecl {
    /// Constant name, or a script-local id for anonymous types
    pub name: String,
    #[serde(default)]
    pub kind: DeclKind,
    pub superclass: Option<String>,
    /// File the constant is defined in
    pub path: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
    /// Redefined `name` method; `null` makes it return nil
    #[serde(default, deserialize_with = "present")]
    pub display_name: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    #[default]
    Call,
    CCall,
    BCall,
}

impl CallKind {
    fn event_kind(self) -> EventKind {
        match self {
            CallKind::Call => EventKind::Call,
            CallKind::CCall => EventKind::CCall,
            CallKind::BCall => EventKind::BlockCall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallDecl {
    pub receiver: String,
    /// Call on a fresh instance of the receiver class
    #[serde(default)]
    pub instance: bool,
    pub method: String,
    #[serde(default)]
    pub kind: CallKind,
    /// Module the method is defined in, when not the receiver's own
    pub defined_in: Option<String>,
    /// `path:lineno` of the method definition
    pub defined_at: Option<String>,
    /// `path:lineno` of the call site
    pub caller: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
    #[serde(default)]
    pub calls: Vec<CallDecl>,
}

/// Distinguish a missing field from an explicit `null`
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

fn parse_location(spec: &str) -> Result<Location> {
    let (path, lineno) = spec
        .rsplit_once(':')
        .with_context(|| format!("Invalid location {}: expected path:lineno", spec))?;
    let lineno = lineno
        .parse()
        .with_context(|| format!("Invalid line number in {}", spec))?;
    Ok(Location::new(path, lineno))
}

impl Program {
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse program JSON")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&content).with_context(|| format!("Invalid program {}", path.display()))
    }

    /// Define the program's types on `engine` and resolve its calls
    pub fn install(&self, engine: &Engine) -> Result<Script> {
        let mut modules: FnvHashMap<String, ModuleRef> = FnvHashMap::default();
        {
            let mut space = engine.space_mut();
            for decl in &self.modules {
                if modules.contains_key(&decl.name) || (!decl.anonymous && space.lookup_const(&decl.name).is_some()) {
                    bail!("Module {} is declared twice", decl.name);
                }

                let superclass = match (&decl.superclass, decl.kind) {
                    (None, _) => None,
                    (Some(name), DeclKind::Class) => Some(
                        modules
                            .get(name)
                            .copied()
                            .or_else(|| space.lookup_const(name))
                            .with_context(|| format!("Unknown superclass {} of {}", name, decl.name))?,
                    ),
                    (Some(_), DeclKind::Module) => bail!("Module {} cannot have a superclass", decl.name),
                };

                let module = match (decl.kind, decl.anonymous) {
                    (DeclKind::Module, false) => space.define_module(&decl.name),
                    (DeclKind::Module, true) => space.anonymous_module(),
                    (DeclKind::Class, false) => space.define_class(&decl.name, superclass),
                    (DeclKind::Class, true) => space.anonymous_class(superclass),
                };
                if let Some(path) = &decl.path {
                    space.set_source_path(module, path.clone());
                }
                if let Some(display_name) = &decl.display_name {
                    space.override_name(module, display_name.clone());
                }
                modules.insert(decl.name.clone(), module);
            }
        }

        let lookup = |name: &str| -> Result<ModuleRef> {
            modules
                .get(name)
                .copied()
                .or_else(|| engine.space().lookup_const(name))
                .with_context(|| format!("Unknown module {}", name))
        };

        let steps = self
            .calls
            .iter()
            .map(|call| Step::resolve(call, engine, &lookup))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(modules = modules.len(), calls = steps.len(), "program installed");
        Ok(Script { modules, steps })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiver {
    Module(ModuleRef),
    InstanceOf(ModuleRef),
}

#[derive(Debug, Clone)]
struct Step {
    receiver: Receiver,
    method: String,
    kind: EventKind,
    defined_in: Option<ModuleRef>,
    location: Location,
    caller: Location,
    calls: Vec<Step>,
}

impl Step {
    fn resolve<L>(decl: &CallDecl, engine: &Engine, lookup: &L) -> Result<Self>
    where
        L: Fn(&str) -> Result<ModuleRef>,
    {
        let module = lookup(&decl.receiver)?;
        let receiver = if decl.instance {
            if !engine.space().is_class(Value::Module(module)) {
                bail!("{} is not a class and cannot be instantiated", decl.receiver);
            }
            Receiver::InstanceOf(module)
        } else {
            Receiver::Module(module)
        };

        let defined_in = decl.defined_in.as_deref().map(lookup).transpose()?;
        let location = match &decl.defined_at {
            Some(spec) => parse_location(spec)?,
            None => Location::new("", 0),
        };
        let caller = match &decl.caller {
            Some(spec) => parse_location(spec)?,
            None => Location::new("", 0),
        };
        let calls = decl
            .calls
            .iter()
            .map(|call| Step::resolve(call, engine, lookup))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            receiver,
            method: decl.method.clone(),
            kind: decl.kind.event_kind(),
            defined_in,
            location,
            caller,
            calls,
        })
    }

    fn run(&self, engine: &Engine) -> TraceResult<()> {
        let receiver = match self.receiver {
            Receiver::Module(module) => Value::Module(module),
            Receiver::InstanceOf(class) => Value::Object(engine.space_mut().allocate(class)),
        };

        let mut site = CallSite::new(receiver, self.method.as_str());
        site.kind = self.kind;
        site.defined_class = self.defined_in;
        site.location = self.location.clone();
        site.caller = self.caller.clone();

        engine.invoke(site, || self.calls.iter().try_for_each(|call| call.run(engine)))
    }
}

/// An installed program, ready to replay
#[derive(Debug, Clone)]
pub struct Script {
    modules: FnvHashMap<String, ModuleRef>,
    steps: Vec<Step>,
}

impl Script {
    /// Module declared under `name`
    pub fn module(&self, name: &str) -> Option<ModuleRef> {
        self.modules.get(name).copied()
    }

    /// Replay every top-level call in order
    pub fn run(&self, engine: &Engine) -> TraceResult<()> {
        self.steps.iter().try_for_each(|step| step.run(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSet;
    use crate::source::hook;
    use std::cell::RefCell;
    use std::rc::Rc;

    const PROGRAM: &str = r#"{
        "modules": [
            { "name": "Base", "path": "/app/base.rb" },
            { "name": "A", "kind": "module" },
            { "name": "B", "superclass": "Base" },
            { "name": "anon", "anonymous": true, "display_name": "Anonymous" }
        ],
        "calls": [
            { "receiver": "A", "method": "call_b", "caller": "/app/main.rb:2",
              "calls": [
                { "receiver": "B", "instance": true, "method": "call", "caller": "/app/a.rb:8" },
                { "receiver": "anon", "method": "new", "kind": "c_call" }
              ] }
        ]
    }"#;

    #[test]
    fn test_install_defines_types() {
        let engine = Engine::new();
        let program = Program::from_json_str(PROGRAM).unwrap();
        let script = program.install(&engine).unwrap();

        let space = engine.space();
        let base = script.module("Base").unwrap();
        let b = script.module("B").unwrap();
        let anon = script.module("anon").unwrap();
        assert_eq!(space.superclass(b), Some(base));
        assert_eq!(space.source_path(base), Some("/app/base.rb"));
        assert!(!space.is_class(Value::Module(script.module("A").unwrap())));
        assert_eq!(space.const_name(anon), None);
        assert_eq!(space.name(anon), Some("Anonymous"));
        assert_eq!(space.lookup_const("anon"), None);
    }

    #[test]
    fn test_run_replays_nested_calls() {
        let engine = Engine::new();
        let script = Program::from_json_str(PROGRAM).unwrap().install(&engine).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let id = engine
            .subscribe(
                EventSet::TRACER_DEFAULT,
                hook(move |event| {
                    sink.borrow_mut().push(format!(
                        "{}:{}@{}",
                        event.kind.name(),
                        event.method_id,
                        event.backtrace.first().map(ToString::to_string).unwrap_or_default()
                    ));
                    Ok(())
                }),
            )
            .unwrap();
        engine.enable(id).unwrap();

        script.run(&engine).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "call:call_b@/app/main.rb:2",
                "call:call@/app/a.rb:8",
                "return:call@/app/a.rb:8",
                "c_call:new@:0",
                "c_return:new@:0",
                "return:call_b@/app/main.rb:2",
            ]
        );
    }

    #[test]
    fn test_display_name_null_is_distinct_from_missing() {
        let program = Program::from_json_str(
            r#"{ "modules": [ { "name": "A", "display_name": null }, { "name": "B" } ] }"#,
        )
        .unwrap();
        assert_eq!(program.modules[0].display_name, Some(None));
        assert_eq!(program.modules[1].display_name, None);
    }

    #[test]
    fn test_unknown_receiver_fails_install() {
        let engine = Engine::new();
        let program =
            Program::from_json_str(r#"{ "calls": [ { "receiver": "Missing", "method": "x" } ] }"#).unwrap();
        let err = program.install(&engine).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_module_cannot_be_instantiated() {
        let engine = Engine::new();
        let program = Program::from_json_str(
            r#"{ "modules": [ { "name": "M", "kind": "module" } ],
                 "calls": [ { "receiver": "M", "instance": true, "method": "x" } ] }"#,
        )
        .unwrap();
        assert!(program.install(&engine).is_err());
    }

    #[test]
    fn test_duplicate_and_invalid_declarations() {
        let engine = Engine::new();
        let duplicate = Program::from_json_str(
            r#"{ "modules": [ { "name": "A" }, { "name": "A" } ] }"#,
        )
        .unwrap();
        assert!(duplicate.install(&engine).is_err());

        let module_superclass = Program::from_json_str(
            r#"{ "modules": [ { "name": "M", "kind": "module", "superclass": "Object" } ] }"#,
        )
        .unwrap();
        assert!(module_superclass.install(&Engine::new()).is_err());
    }

    #[test]
    fn test_invalid_location() {
        assert!(parse_location("/app/a.rb:12").is_ok());
        assert!(parse_location("/app/a.rb").is_err());
        assert!(parse_location("/app/a.rb:x").is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(Program::from_json_str(r#"{ "threads": [] }"#).is_err());
    }
}

//! Tool classes and tool instances.
//!
//! A tool class describes the dependency shape of one kind of build step:
//! an ordered table of named roles, execution parameters, and a redo body.
//! Classes are identified by their definition location (source file + line,
//! captured from the caller); deriving a class may replace inherited roles
//! only with no-less-restrictive ones.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::Location;
use std::rc::Rc;
use std::sync::OnceLock;

use futures::future::LocalBoxFuture;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::depend::{DependencyValue, ParamValue, RawValue, Role};
use crate::error::{Error, Result};
use crate::run::Redo;

/// At least one word, all upper case: an execution parameter.
fn uppercase_name_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new("^[A-Z][A-Z0-9]*(_[A-Z][A-Z0-9]*)*$").unwrap())
}

/// At least two words, all lower case: a dependency role.
fn lowercase_multiword_name_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new("^[a-z][a-z0-9]*(_[a-z][a-z0-9]*)+$").unwrap())
}

const UNIT_SEPARATOR: u8 = 0x1f;

/// Where a tool class was defined; the stable identity of the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefinitionLocation {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for DefinitionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl DefinitionLocation {
    #[track_caller]
    fn of_caller() -> DefinitionLocation {
        let loc = Location::caller();
        DefinitionLocation {
            file: loc.file(),
            line: loc.line(),
        }
    }

    pub(crate) fn permanent_id(&self) -> Vec<u8> {
        format!("{}:{}", self.file, self.line).into_bytes()
    }
}

thread_local! {
    // Class name by definition location.  The engine is single-threaded per
    // working tree; the registry's scope matches.
    static REGISTRY: RefCell<FxHashMap<DefinitionLocation, String>> =
        RefCell::new(FxHashMap::default());
}

pub type RedoBody = Rc<dyn Fn(Redo) -> LocalBoxFuture<'static, anyhow::Result<bool>>>;

pub struct ToolClass {
    name: String,
    location: DefinitionLocation,
    /// Roles ordered by (category, required-first, name); the order is part
    /// of the fingerprint contract.
    roles: Vec<(String, Role)>,
    params: BTreeMap<String, ParamValue>,
    redo: Option<RedoBody>,
    /// Source files of this class and all its ancestors.
    definition_paths: BTreeSet<String>,
}

impl fmt::Debug for ToolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolClass")
            .field("name", &self.name)
            .field("location", &self.location)
            .finish()
    }
}

impl ToolClass {
    #[track_caller]
    pub fn builder(name: &str) -> ToolClassBuilder {
        ToolClassBuilder {
            name: name.to_string(),
            location: DefinitionLocation::of_caller(),
            parent: None,
            roles: Vec::new(),
            params: Vec::new(),
            redo: None,
        }
    }

    /// Start a derived class from this one.  Roles and parameters are
    /// inherited; replacing a role is only legal when the replacement is no
    /// less restrictive.
    #[track_caller]
    pub fn derive(self: &Rc<Self>, name: &str) -> ToolClassBuilder {
        ToolClassBuilder {
            name: name.to_string(),
            location: DefinitionLocation::of_caller(),
            parent: Some(self.clone()),
            roles: Vec::new(),
            params: Vec::new(),
            redo: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> DefinitionLocation {
        self.location
    }

    pub(crate) fn roles(&self) -> &[(String, Role)] {
        &self.roles
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub(crate) fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub(crate) fn redo_body(&self) -> Option<&RedoBody> {
        self.redo.as_ref()
    }

    pub(crate) fn definition_paths(&self) -> &BTreeSet<String> {
        &self.definition_paths
    }

    /// Identity of the class in the run-database, stable across runs as
    /// long as the defining source does not move.
    pub(crate) fn permanent_id(&self) -> Vec<u8> {
        self.location.permanent_id()
    }

    /// Build an instance with the given explicit dependency bindings.
    pub fn instantiate(
        self: &Rc<Self>,
        binds: Vec<(&str, RawValue)>,
    ) -> Result<ToolInstance> {
        ToolInstance::new(self, binds)
    }
}

pub struct ToolClassBuilder {
    name: String,
    location: DefinitionLocation,
    parent: Option<Rc<ToolClass>>,
    roles: Vec<(String, Role)>,
    params: Vec<(String, ParamValue)>,
    redo: Option<RedoBody>,
}

impl ToolClassBuilder {
    /// Declare (or, in a derived class, replace) a dependency role.
    pub fn role(mut self, name: &str, role: Role) -> Self {
        self.roles.push((name.to_string(), role));
        self
    }

    /// Declare (or override) an execution parameter.
    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.to_string(), value.into()));
        self
    }

    /// The redo body.  A class without one (own or inherited) is abstract
    /// and cannot be instantiated.
    pub fn redo<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(Redo) -> Fut + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + 'static,
    {
        self.redo = Some(Rc::new(move |redo| Box::pin(body(redo))));
        self
    }

    pub fn build(self) -> Result<Rc<ToolClass>> {
        if self.name.is_empty() {
            return Err(Error::Definition("class name must not be empty".to_string()));
        }

        let mut roles: BTreeMap<String, Role> = BTreeMap::new();
        let mut params: BTreeMap<String, ParamValue> = BTreeMap::new();
        let mut definition_paths = BTreeSet::new();
        if let Some(parent) = &self.parent {
            for (name, role) in &parent.roles {
                roles.insert(name.clone(), role.clone());
            }
            params.extend(parent.params.clone());
            definition_paths.extend(parent.definition_paths.iter().cloned());
        }
        definition_paths.insert(self.location.file.to_string());

        let mut seen = BTreeSet::new();
        for (name, role) in self.roles {
            if !lowercase_multiword_name_re().is_match(&name) {
                return Err(Error::Definition(format!(
                    "invalid dependency role name: {:?}\n\
                     \x20 | every dependency role must be named like 'lower_case' \
                     (at least two words)",
                    name
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Definition(format!(
                    "dependency role declared more than once: {:?}",
                    name
                )));
            }
            if let Err(reason) = role.check_declaration() {
                return Err(Error::Definition(format!(
                    "invalid dependency role {:?}\n  | reason: {}",
                    name, reason
                )));
            }
            if let Some(base) = roles.get(&name) {
                if !role.no_less_restrictive_than(base) {
                    return Err(Error::Definition(format!(
                        "role {:?} of base class may only be replaced by a role that is \
                         at least as restrictive",
                        name
                    )));
                }
            }
            roles.insert(name, role);
        }

        for (name, value) in self.params {
            if !uppercase_name_re().is_match(&name) {
                return Err(Error::Definition(format!(
                    "invalid execution parameter name: {:?}\n\
                     \x20 | every execution parameter must be named like 'UPPER_CASE'",
                    name
                )));
            }
            if let Some(base) = params.get(&name) {
                if std::mem::discriminant(base) != std::mem::discriminant(&value) {
                    return Err(Error::Definition(format!(
                        "execution parameter {:?} of base class may only be overridden \
                         with a value of the same kind",
                        name
                    )));
                }
            }
            params.insert(name, value);
        }

        let redo = self
            .redo
            .or_else(|| self.parent.as_ref().and_then(|p| p.redo.clone()));

        // Stable role order: inputs first, required before optional, then by
        // name.  The order identifies roles within the fingerprint.
        let mut ordered: Vec<(String, Role)> = roles.into_iter().collect();
        ordered.sort_by(|(an, a), (bn, b)| {
            (a.category(), !a.required(), an).cmp(&(b.category(), !b.required(), bn))
        });

        REGISTRY.with(|registry| {
            let mut registry = registry.borrow_mut();
            if let Some(existing) = registry.get(&self.location) {
                return Err(Error::DefinitionAmbiguity(format!(
                    "invalid tool class definition: another class was defined at the same \
                     source location\n  | location: {}\n  | class: {:?}",
                    self.location, existing
                )));
            }
            registry.insert(self.location, self.name.clone());
            Ok(())
        })?;

        Ok(Rc::new(ToolClass {
            name: self.name,
            location: self.location,
            roles: ordered,
            params,
            redo,
            definition_paths,
        }))
    }
}

/// Content-addressed identity of a tool instance's explicit dependencies.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An immutable (class, concrete explicit dependencies) pair.  Two
/// instances of the same class with equal fingerprints share one redo
/// history.
pub struct ToolInstance {
    class: Rc<ToolClass>,
    /// Validated values of explicit roles; `None` for unset optional ones.
    values: BTreeMap<String, Option<DependencyValue>>,
    fingerprint: Fingerprint,
}

impl fmt::Debug for ToolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInstance")
            .field("class", &self.class.name)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl ToolInstance {
    pub fn new(class: &Rc<ToolClass>, binds: Vec<(&str, RawValue)>) -> Result<ToolInstance> {
        let mut values: BTreeMap<String, Option<DependencyValue>> = BTreeMap::new();

        for (name, raw) in binds {
            let role = class.role(name).ok_or_else(|| {
                let names = class
                    .roles
                    .iter()
                    .map(|(n, _)| format!("{:?}", n))
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::Dependency(format!(
                    "binding does not name a dependency role of {:?}: {:?}\n\
                     \x20 | dependency roles: {}",
                    class.name, name, names
                ))
            })?;
            if !role.explicit() {
                return Err(Error::Dependency(format!(
                    "binding names a non-explicit dependency role: {:?}\n\
                     \x20 | non-explicit dependencies must not be assigned at construction",
                    name
                )));
            }
            if values.contains_key(name) {
                return Err(Error::Dependency(format!(
                    "dependency role bound more than once: {:?}",
                    name
                )));
            }
            let validated = role.validate(raw).map_err(|reason| {
                Error::Dependency(format!(
                    "binding for dependency role {:?} is invalid\n  | reason: {}",
                    name, reason
                ))
            })?;
            values.insert(name.to_string(), Some(validated));
        }

        for (name, role) in &class.roles {
            if !role.explicit() || values.contains_key(name) {
                continue;
            }
            if role.required() {
                return Err(Error::Dependency(format!(
                    "missing binding for required and explicit dependency role: {:?}",
                    name
                )));
            }
            values.insert(name.clone(), None);
        }

        let fingerprint = fingerprint_of(class, &values);
        Ok(ToolInstance {
            class: class.clone(),
            values,
            fingerprint,
        })
    }

    pub fn class(&self) -> &Rc<ToolClass> {
        &self.class
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The validated value bound to an explicit role (`None` when unset).
    pub fn value(&self, name: &str) -> Option<&DependencyValue> {
        self.values.get(name).and_then(|v| v.as_ref())
    }

    pub(crate) fn values(&self) -> &BTreeMap<String, Option<DependencyValue>> {
        &self.values
    }
}

/// Hash the explicit dependency values of an instance, in role-table order.
fn fingerprint_of(
    class: &ToolClass,
    values: &BTreeMap<String, Option<DependencyValue>>,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    let mut buf = Vec::new();
    for (name, role) in &class.roles {
        if !role.explicit() {
            continue;
        }
        buf.clear();
        role.write_instance_id(&mut buf);
        match values.get(name).and_then(|v| v.as_ref()) {
            Some(value) => value.write_value_id(&mut buf),
            None => buf.push(0xff),
        }
        buf.push(UNIT_SEPARATOR);
        hasher.update(&buf);
    }
    Fingerprint(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_class() -> Rc<ToolClass> {
        ToolClass::builder("Copy")
            .role("source_file", Role::input_file())
            .role("destination_file", Role::output_file())
            .param("BUFFER_SIZE", 4096)
            .redo(|_redo| async { Ok(false) })
            .build()
            .unwrap()
    }

    #[test]
    fn fingerprints_depend_only_on_explicit_values() {
        let class = copy_class();
        let a = class
            .instantiate(vec![
                ("source_file", "a.txt".into()),
                ("destination_file", "b.txt".into()),
            ])
            .unwrap();
        // Equivalent after canonicalization.
        let b = class
            .instantiate(vec![
                ("source_file", "./a.txt".into()),
                ("destination_file", "b.txt".into()),
            ])
            .unwrap();
        let c = class
            .instantiate(vec![
                ("source_file", "other.txt".into()),
                ("destination_file", "b.txt".into()),
            ])
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn binding_validation() {
        let class = copy_class();
        assert!(matches!(
            class.instantiate(vec![("source_file", "a.txt".into())]),
            Err(Error::Dependency(_))
        ));
        assert!(matches!(
            class.instantiate(vec![
                ("source_file", "a.txt".into()),
                ("destination_file", "b.txt".into()),
                ("unknown_role", "x".into()),
            ]),
            Err(Error::Dependency(_))
        ));
        assert!(matches!(
            class.instantiate(vec![
                ("source_file", "dir/".into()),
                ("destination_file", "b.txt".into()),
            ]),
            Err(Error::Dependency(_))
        ));
    }

    #[test]
    fn duplicate_definition_location_is_rejected() {
        let build_at_same_line = |name: &str| {
            ToolClass::builder(name)
                .redo(|_redo| async { Ok(false) })
                .build()
        };
        assert!(build_at_same_line("First").is_ok());
        // Same definition location as the first class.
        assert!(matches!(
            build_at_same_line("Second"),
            Err(Error::DefinitionAmbiguity(_))
        ));
    }

    #[test]
    fn derive_checks_narrowing() {
        let base = ToolClass::builder("Base")
            .role("source_file", Role::input_file().optional())
            .redo(|_redo| async { Ok(false) })
            .build()
            .unwrap();

        // Strengthening required is fine.
        assert!(base
            .derive("Stricter")
            .role("source_file", Role::input_file())
            .build()
            .is_ok());

        // Widening to a different category is not.
        assert!(matches!(
            base.derive("Broken")
                .role("source_file", Role::output_file())
                .build(),
            Err(Error::Definition(_))
        ));
    }

    #[test]
    fn widening_required_to_optional_is_rejected() {
        let base = ToolClass::builder("BaseRequired")
            .role("source_file", Role::input_file())
            .redo(|_redo| async { Ok(false) })
            .build()
            .unwrap();
        assert!(matches!(
            base.derive("Loosened")
                .role("source_file", Role::input_file().optional())
                .build(),
            Err(Error::Definition(_))
        ));
    }

    #[test]
    fn sequence_multiplicity_may_not_grow() {
        let base = ToolClass::builder("Many")
            .role("source_files", Role::input_file().times(0..10))
            .redo(|_redo| async { Ok(false) })
            .build()
            .unwrap();
        assert!(matches!(
            base.derive("TooMany")
                .role("source_files", Role::input_file().times(0..11))
                .build(),
            Err(Error::Definition(_))
        ));
    }

    #[test]
    fn name_conventions_are_enforced() {
        assert!(matches!(
            ToolClass::builder("Bad")
                .role("source", Role::input_file())
                .build(),
            Err(Error::Definition(_))
        ));
        assert!(matches!(
            ToolClass::builder("Bad2").param("buffer_size", 1).build(),
            Err(Error::Definition(_))
        ));
    }
}

//! Dependency roles: the declared slots of a tool class, their validation
//! rules, and the concrete values they produce.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::fs::FsKind;
use crate::path::TreePath;

/// Accepted number of members of a sequence-valued role.
///
/// Stored in normalized form: `stop` is `max + 1` (or unbounded), an empty
/// range collapses to `[0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multiplicity {
    start: usize,
    stop: Option<usize>,
    step: usize,
}

impl Multiplicity {
    pub fn new(start: usize, stop: Option<usize>, step: usize) -> Multiplicity {
        assert!(step > 0, "multiplicity step must be positive");
        let (start, stop, step) = match stop {
            Some(stop) if stop > start => {
                let c = (stop - start - 1) / step;
                if c == 0 {
                    (start, Some(start + 1), 1)
                } else {
                    (start, Some(c * step + start + 1), step)
                }
            }
            Some(_) => (0, Some(0), 1),
            None => (start, None, step),
        };
        Multiplicity { start, stop, step }
    }

    pub fn contains(&self, count: usize) -> bool {
        if count < self.start {
            return false;
        }
        if let Some(stop) = self.stop {
            if count >= stop {
                return false;
            }
        }
        (count - self.start) % self.step == 0
    }

    /// Whether every count accepted by `self` is accepted by `other` and the
    /// ranges share their structure (the role-narrowing requirement).
    pub fn is_no_wider_than(&self, other: &Multiplicity) -> bool {
        if self.step != other.step || self.start < other.start {
            return false;
        }
        match (self.stop, other.stop) {
            (None, Some(_)) => false,
            (None, None) => true,
            (Some(_), None) => true,
            (Some(s), Some(o)) => s <= o,
        }
    }
}

impl fmt::Display for Multiplicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stop == Some(self.start + 1) {
            return write!(f, "[{}]", self.start);
        }
        let start = if self.start > 0 {
            self.start.to_string()
        } else {
            String::new()
        };
        let stop = match self.stop {
            Some(stop) => stop.to_string(),
            None => String::new(),
        };
        if self.step > 1 {
            write!(f, "[{}:{}:{}]", start, stop, self.step)
        } else {
            write!(f, "[{}:{}]", start, stop)
        }
    }
}

impl From<usize> for Multiplicity {
    fn from(n: usize) -> Self {
        Multiplicity::new(n, Some(n + 1), 1)
    }
}
impl From<std::ops::Range<usize>> for Multiplicity {
    fn from(r: std::ops::Range<usize>) -> Self {
        Multiplicity::new(r.start, Some(r.end), 1)
    }
}
impl From<std::ops::RangeFrom<usize>> for Multiplicity {
    fn from(r: std::ops::RangeFrom<usize>) -> Self {
        Multiplicity::new(r.start, None, 1)
    }
}
impl From<std::ops::RangeTo<usize>> for Multiplicity {
    fn from(r: std::ops::RangeTo<usize>) -> Self {
        Multiplicity::new(0, Some(r.end), 1)
    }
}
impl From<std::ops::RangeFull> for Multiplicity {
    fn from(_: std::ops::RangeFull) -> Self {
        Multiplicity::new(0, None, 1)
    }
}
impl From<std::ops::RangeInclusive<usize>> for Multiplicity {
    fn from(r: std::ops::RangeInclusive<usize>) -> Self {
        Multiplicity::new(*r.start(), Some(*r.end() + 1), 1)
    }
}

/// A "fundamental" value: execution parameters and object outputs are trees
/// of these.  Every value has one canonical byte encoding, so digests over
/// parameters are stable across runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            ParamValue::None => out.push(0),
            ParamValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            ParamValue::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            ParamValue::Float(x) => {
                out.push(3);
                out.extend_from_slice(&x.to_bits().to_le_bytes());
            }
            ParamValue::Str(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            ParamValue::Bytes(b) => {
                out.push(5);
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
            }
            ParamValue::Seq(values) => {
                out.push(6);
                out.extend_from_slice(&(values.len() as u64).to_le_bytes());
                for v in values {
                    v.write_canonical(out);
                }
            }
            ParamValue::Map(map) => {
                out.push(7);
                out.extend_from_slice(&(map.len() as u64).to_le_bytes());
                for (k, v) in map {
                    out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                    out.extend_from_slice(k.as_bytes());
                    v.write_canonical(out);
                }
            }
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_canonical(&mut out);
        out
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}
impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}
impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        ParamValue::Int(i as i64)
    }
}
impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Float(x)
    }
}
impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}
impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}
impl From<Vec<ParamValue>> for ParamValue {
    fn from(v: Vec<ParamValue>) -> Self {
        ParamValue::Seq(v)
    }
}

/// A validated environment-variable value.  `groups` holds the named-group
/// captures of the validation pattern; consumers get the raw string when the
/// pattern has no named groups and the group map otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVarValue {
    pub name: String,
    pub raw: String,
    pub groups: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvVarCapture<'a> {
    Raw(&'a str),
    Groups(&'a BTreeMap<String, String>),
}

impl EnvVarValue {
    pub fn capture(&self) -> EnvVarCapture<'_> {
        if self.groups.is_empty() {
            EnvVarCapture::Raw(&self.raw)
        } else {
            EnvVarCapture::Groups(&self.groups)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoleCategory {
    Input,
    Intermediate,
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleKind {
    RegularFile,
    NonRegularFile,
    Directory,
    EnvVar {
        name: String,
        pattern: String,
        example: String,
    },
    Object,
}

impl RoleKind {
    fn id(&self) -> u8 {
        match self {
            RoleKind::RegularFile => 0,
            RoleKind::NonRegularFile => 1,
            RoleKind::Directory => 2,
            RoleKind::EnvVar { .. } => 3,
            RoleKind::Object => 4,
        }
    }
}

/// A concrete dependency value, produced by [`Role::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyValue {
    Path(TreePath),
    Paths(Vec<TreePath>),
    EnvVar(EnvVarValue),
    Object(ParamValue),
    Objects(Vec<ParamValue>),
}

impl DependencyValue {
    /// The filesystem paths contained in this value, in declared order.
    pub fn paths(&self) -> Vec<&TreePath> {
        match self {
            DependencyValue::Path(p) => vec![p],
            DependencyValue::Paths(ps) => ps.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Canonical bytes identifying this value within a fingerprint.
    pub(crate) fn write_value_id(&self, out: &mut Vec<u8>) {
        match self {
            DependencyValue::Path(p) => {
                out.push(0);
                out.extend_from_slice(p.to_string().as_bytes());
            }
            DependencyValue::Paths(ps) => {
                out.push(1);
                for p in ps {
                    out.extend_from_slice(p.to_string().as_bytes());
                    out.push(0);
                }
            }
            DependencyValue::EnvVar(ev) => {
                out.push(2);
                out.extend_from_slice(ev.raw.as_bytes());
            }
            DependencyValue::Object(v) => {
                out.push(3);
                v.write_canonical(out);
            }
            DependencyValue::Objects(vs) => {
                out.push(4);
                for v in vs {
                    v.write_canonical(out);
                }
            }
        }
    }
}

/// An unvalidated constructor argument.
#[derive(Debug, Clone)]
pub enum RawValue {
    Str(String),
    Path(TreePath),
    Seq(Vec<RawValue>),
    Object(ParamValue),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_string())
    }
}
impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Str(s)
    }
}
impl From<TreePath> for RawValue {
    fn from(p: TreePath) -> Self {
        RawValue::Path(p)
    }
}
impl From<&TreePath> for RawValue {
    fn from(p: &TreePath) -> Self {
        RawValue::Path(p.clone())
    }
}
impl From<ParamValue> for RawValue {
    fn from(v: ParamValue) -> Self {
        RawValue::Object(v)
    }
}
impl<T: Into<RawValue>> From<Vec<T>> for RawValue {
    fn from(v: Vec<T>) -> Self {
        RawValue::Seq(v.into_iter().map(Into::into).collect())
    }
}

/// One named dependency slot of a tool class.
#[derive(Debug, Clone)]
pub struct Role {
    category: RoleCategory,
    kind: RoleKind,
    /// Compiled, anchored validation pattern of an env-var role.
    pattern: Option<Regex>,
    required: bool,
    explicit: bool,
    unique: bool,
    multiplicity: Option<Multiplicity>,
    ignore_permission: bool,
    replace_by_same_content: bool,
}

fn fs_role(category: RoleCategory, kind: RoleKind) -> Role {
    Role {
        category,
        kind,
        pattern: None,
        required: true,
        explicit: true,
        unique: true,
        multiplicity: None,
        ignore_permission: false,
        replace_by_same_content: true,
    }
}

impl Role {
    pub fn input_file() -> Role {
        fs_role(RoleCategory::Input, RoleKind::RegularFile)
    }
    pub fn input_nonregular_file() -> Role {
        fs_role(RoleCategory::Input, RoleKind::NonRegularFile)
    }
    pub fn input_directory() -> Role {
        fs_role(RoleCategory::Input, RoleKind::Directory)
    }
    pub fn output_file() -> Role {
        fs_role(RoleCategory::Output, RoleKind::RegularFile)
    }
    pub fn output_nonregular_file() -> Role {
        fs_role(RoleCategory::Output, RoleKind::NonRegularFile)
    }
    pub fn output_directory() -> Role {
        fs_role(RoleCategory::Output, RoleKind::Directory)
    }
    pub fn intermediate_file() -> Role {
        fs_role(RoleCategory::Intermediate, RoleKind::RegularFile)
    }
    pub fn intermediate_directory() -> Role {
        fs_role(RoleCategory::Intermediate, RoleKind::Directory)
    }

    /// An object output: a structured value assigned during redo.
    pub fn output_object() -> Role {
        let mut role = fs_role(RoleCategory::Output, RoleKind::Object);
        role.explicit = false;
        role
    }

    /// An environment-variable input.  The variable's value must full-match
    /// `pattern`; `example` must do so as well and documents the shape.
    pub fn env_var(name: &str, pattern: &str, example: &str) -> crate::error::Result<Role> {
        use crate::error::Error;
        if name.is_empty() {
            return Err(Error::Definition("'name' must not be empty".to_string()));
        }
        let compiled = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            Error::Definition(format!("invalid validation pattern: {}", e))
        })?;
        if !compiled.is_match(example) {
            return Err(Error::Definition(format!(
                "'example' is not matched by 'pattern': {:?}",
                example
            )));
        }
        let mut role = fs_role(
            RoleCategory::Input,
            RoleKind::EnvVar {
                name: name.to_string(),
                pattern: pattern.to_string(),
                example: example.to_string(),
            },
        );
        role.pattern = Some(compiled);
        Ok(role)
    }

    pub fn optional(mut self) -> Role {
        self.required = false;
        self
    }

    /// The concrete value is assigned during redo instead of at
    /// construction.
    pub fn nonexplicit(mut self) -> Role {
        self.explicit = false;
        self
    }

    /// Make this a sequence role with the given multiplicity.
    pub fn times(mut self, multiplicity: impl Into<Multiplicity>) -> Role {
        self.multiplicity = Some(multiplicity.into());
        self
    }

    pub fn allow_duplicates(mut self) -> Role {
        self.unique = false;
        self
    }

    /// Exclude permission bits and ownership from change detection.
    pub fn ignore_permission(mut self) -> Role {
        self.ignore_permission = true;
        self
    }

    /// Keep an output file whose replacement has identical content (the
    /// output is then not treated as modified).
    pub fn keep_same_content(mut self) -> Role {
        self.replace_by_same_content = false;
        self
    }

    pub fn category(&self) -> RoleCategory {
        self.category
    }
    pub fn kind(&self) -> &RoleKind {
        &self.kind
    }
    pub fn required(&self) -> bool {
        self.required
    }
    pub fn explicit(&self) -> bool {
        self.explicit
    }
    pub fn multiplicity(&self) -> Option<&Multiplicity> {
        self.multiplicity.as_ref()
    }
    pub fn ignores_permission(&self) -> bool {
        self.ignore_permission
    }
    pub(crate) fn replaces_by_same_content(&self) -> bool {
        self.replace_by_same_content
    }

    pub(crate) fn is_fs_kind(&self) -> bool {
        matches!(
            self.kind,
            RoleKind::RegularFile | RoleKind::NonRegularFile | RoleKind::Directory
        )
    }

    pub(crate) fn env_var_name(&self) -> Option<&str> {
        match &self.kind {
            RoleKind::EnvVar { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Structural validity of the role declaration itself; checked when a
    /// class is built.
    pub(crate) fn check_declaration(&self) -> Result<(), String> {
        match &self.kind {
            RoleKind::EnvVar { .. } => {
                if self.category != RoleCategory::Input {
                    return Err("environment-variable roles must be inputs".to_string());
                }
                if self.multiplicity.is_some() {
                    return Err("environment-variable roles must not have a multiplicity"
                        .to_string());
                }
            }
            RoleKind::Object => {
                if self.category != RoleCategory::Output {
                    return Err("object roles must be outputs".to_string());
                }
                if self.explicit {
                    return Err("object roles must not be explicit".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether overriding `base` with `self` keeps the declared contract at
    /// least as restrictive (legal role replacement in a derived class).
    pub fn no_less_restrictive_than(&self, base: &Role) -> bool {
        if self.category != base.category {
            return false;
        }
        let kinds_compatible = match (&self.kind, &base.kind) {
            (
                RoleKind::EnvVar { name, pattern, .. },
                RoleKind::EnvVar {
                    name: base_name,
                    pattern: base_pattern,
                    ..
                },
            ) => name == base_name && pattern == base_pattern,
            (a, b) => a.id() == b.id(),
        };
        if !kinds_compatible {
            return false;
        }
        if self.multiplicity.is_some() != base.multiplicity.is_some() {
            return false;
        }
        if let (Some(m), Some(base_m)) = (&self.multiplicity, &base.multiplicity) {
            if !m.is_no_wider_than(base_m) {
                return false;
            }
        }
        if base.required && !self.required {
            return false;
        }
        self.explicit == base.explicit
    }

    /// Bytes identifying the role's shape within a fingerprint; independent
    /// of the bound value.
    pub(crate) fn write_instance_id(&self, out: &mut Vec<u8>) {
        out.push(self.category as u8);
        out.push(self.kind.id());
        out.push(self.explicit as u8);
        if let Some(name) = self.env_var_name() {
            out.extend_from_slice(name.as_bytes());
        }
        out.push(0x1f);
    }

    fn validate_single(&self, raw: RawValue) -> Result<SingleValue, String> {
        match &self.kind {
            RoleKind::RegularFile | RoleKind::NonRegularFile | RoleKind::Directory => {
                let path = match raw {
                    RawValue::Path(p) => p,
                    RawValue::Str(s) => TreePath::new(&s).map_err(|e| e.to_string())?,
                    RawValue::Seq(_) => {
                        return Err("a sequence is not valid for a single path".to_string())
                    }
                    RawValue::Object(_) => {
                        return Err("an object is not valid for a path dependency".to_string())
                    }
                };
                match self.kind {
                    RoleKind::Directory => {
                        if !path.is_dir() {
                            return Err(format!(
                                "non-directory path not valid for directory dependency: {:?}",
                                path.to_string()
                            ));
                        }
                    }
                    _ => {
                        if path.is_dir() {
                            return Err(format!(
                                "directory path not valid for non-directory dependency: {:?}",
                                path.to_string()
                            ));
                        }
                    }
                }
                Ok(SingleValue::Path(path))
            }
            RoleKind::EnvVar { name, pattern, .. } => {
                let value = match raw {
                    RawValue::Str(s) => s,
                    _ => return Err("environment-variable value must be a string".to_string()),
                };
                let regex = self.pattern.as_ref().expect("env-var role has a pattern");
                let captures = regex.captures(&value).ok_or_else(|| {
                    format!(
                        "value {:?} is not matched by validation pattern {:?}",
                        value, pattern
                    )
                })?;
                let mut groups = BTreeMap::new();
                for group_name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(group_name) {
                        groups.insert(group_name.to_string(), m.as_str().to_string());
                    }
                }
                Ok(SingleValue::EnvVar(EnvVarValue {
                    name: name.clone(),
                    raw: value,
                    groups,
                }))
            }
            RoleKind::Object => {
                let value = match raw {
                    RawValue::Object(v) => v,
                    RawValue::Str(s) => ParamValue::Str(s),
                    _ => return Err("object value must be fundamental".to_string()),
                };
                Ok(SingleValue::Object(value))
            }
        }
    }

    /// Validate a constructor argument (or a value assigned during redo).
    pub fn validate(&self, raw: RawValue) -> Result<DependencyValue, String> {
        let multiplicity = match &self.multiplicity {
            None => {
                let single = self.validate_single(raw)?;
                return Ok(single.into_value());
            }
            Some(m) => m,
        };

        let members = match raw {
            RawValue::Seq(members) => members,
            RawValue::Str(_) => {
                return Err(
                    "since dependency has a multiplicity, value must be a sequence \
                     (a string is not one)"
                        .to_string(),
                )
            }
            _ => {
                return Err("since dependency has a multiplicity, value must be a sequence"
                    .to_string())
            }
        };

        if !multiplicity.contains(members.len()) {
            return Err(format!(
                "value has {} members, which is not accepted according to the specified \
                 multiplicity {}",
                members.len(),
                multiplicity
            ));
        }

        let mut singles = Vec::with_capacity(members.len());
        for member in members {
            let single = self.validate_single(member)?;
            if self.unique && singles.contains(&single) {
                return Err(format!(
                    "sequence must be duplicate-free but contains {} more than once",
                    single.describe()
                ));
            }
            singles.push(single);
        }
        Ok(SingleValue::into_sequence(singles, &self.kind))
    }
}

/// One validated member value; sequences are built from these.
#[derive(Debug, Clone, PartialEq)]
enum SingleValue {
    Path(TreePath),
    EnvVar(EnvVarValue),
    Object(ParamValue),
}

impl SingleValue {
    fn into_value(self) -> DependencyValue {
        match self {
            SingleValue::Path(p) => DependencyValue::Path(p),
            SingleValue::EnvVar(v) => DependencyValue::EnvVar(v),
            SingleValue::Object(v) => DependencyValue::Object(v),
        }
    }

    fn into_sequence(singles: Vec<SingleValue>, kind: &RoleKind) -> DependencyValue {
        match kind {
            RoleKind::Object => DependencyValue::Objects(
                singles
                    .into_iter()
                    .map(|s| match s {
                        SingleValue::Object(v) => v,
                        _ => unreachable!(),
                    })
                    .collect(),
            ),
            _ => DependencyValue::Paths(
                singles
                    .into_iter()
                    .map(|s| match s {
                        SingleValue::Path(p) => p,
                        _ => unreachable!(),
                    })
                    .collect(),
            ),
        }
    }

    fn describe(&self) -> String {
        match self {
            SingleValue::Path(p) => format!("{:?}", p.to_string()),
            SingleValue::EnvVar(v) => format!("{:?}", v.raw),
            SingleValue::Object(v) => format!("{:?}", v),
        }
    }
}

/// Role-kind check against the live state of a filesystem object.
pub(crate) fn check_memo_kind(kind: &RoleKind, fs_kind: FsKind) -> Result<(), &'static str> {
    match kind {
        RoleKind::RegularFile => {
            if fs_kind != FsKind::Regular {
                return Err("filesystem object exists but is not a regular file");
            }
        }
        RoleKind::NonRegularFile => {
            if fs_kind == FsKind::Regular {
                return Err("filesystem object exists but is a regular file");
            }
            if fs_kind == FsKind::Directory {
                return Err("filesystem object exists but is a directory");
            }
        }
        RoleKind::Directory => {
            if fs_kind != FsKind::Directory {
                return Err("filesystem object exists but is not a directory");
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplicity_contains() {
        let exactly_two = Multiplicity::from(2);
        assert!(exactly_two.contains(2));
        assert!(!exactly_two.contains(1));
        assert!(!exactly_two.contains(3));

        let at_least_one = Multiplicity::from(1..);
        assert!(!at_least_one.contains(0));
        assert!(at_least_one.contains(100));

        let stepped = Multiplicity::new(1, Some(8), 2);
        assert!(stepped.contains(1));
        assert!(stepped.contains(3));
        assert!(!stepped.contains(2));
        assert!(!stepped.contains(9));
    }

    #[test]
    fn multiplicity_display() {
        assert_eq!(Multiplicity::from(2).to_string(), "[2]");
        assert_eq!(Multiplicity::from(1..).to_string(), "[1:]");
        assert_eq!(Multiplicity::from(0..5).to_string(), "[:5]");
    }

    #[test]
    fn multiplicity_narrowing() {
        let base = Multiplicity::from(0..10);
        assert!(Multiplicity::from(1..5).is_no_wider_than(&base));
        assert!(!Multiplicity::from(0..11).is_no_wider_than(&base));
        assert!(!Multiplicity::from(0..).is_no_wider_than(&base));
        assert!(Multiplicity::from(2..4).is_no_wider_than(&Multiplicity::from(..)));
    }

    #[test]
    fn validate_single_path() {
        let role = Role::input_file();
        let v = role.validate(RawValue::from("src/a.c")).unwrap();
        assert_eq!(v, DependencyValue::Path(TreePath::new("src/a.c").unwrap()));

        // A directory path is not acceptable for a file role.
        assert!(role.validate(RawValue::from("src/")).is_err());
        assert!(Role::input_directory()
            .validate(RawValue::from("src"))
            .is_err());
    }

    #[test]
    fn validate_sequence() {
        let role = Role::input_file().times(1..);
        let v = role
            .validate(RawValue::from(vec!["a.c", "b.c"]))
            .unwrap();
        assert_eq!(
            v,
            DependencyValue::Paths(vec![
                TreePath::new("a.c").unwrap(),
                TreePath::new("b.c").unwrap()
            ])
        );

        // Bare string is not a sequence.
        assert!(role.validate(RawValue::from("a.c")).is_err());
        // Out of range.
        assert!(role.validate(RawValue::Seq(Vec::new())).is_err());
        // Duplicates (also after canonicalization).
        assert!(role
            .validate(RawValue::from(vec!["a.c", "./a.c"]))
            .is_err());
    }

    #[test]
    fn validate_env_var() {
        let role = Role::env_var("LANG", r"(?P<language>[a-z]{2})_.*", "de_CH").unwrap();
        let v = role.validate(RawValue::from("en_US")).unwrap();
        match v {
            DependencyValue::EnvVar(ev) => {
                assert_eq!(ev.raw, "en_US");
                assert_eq!(ev.groups.get("language").unwrap(), "en");
                assert_eq!(
                    ev.capture(),
                    EnvVarCapture::Groups(&ev.groups)
                );
            }
            other => panic!("unexpected value: {:?}", other),
        }
        assert!(role.validate(RawValue::from("english")).is_err());

        // Without named groups the raw string is the capture.
        let plain = Role::env_var("TERM", r"[a-z0-9-]+", "xterm").unwrap();
        match plain.validate(RawValue::from("vt100")).unwrap() {
            DependencyValue::EnvVar(ev) => assert_eq!(ev.capture(), EnvVarCapture::Raw("vt100")),
            other => panic!("unexpected value: {:?}", other),
        }

        assert!(Role::env_var("LANG", r"[a-z]+", "DE").is_err());
    }

    #[test]
    fn role_narrowing_rules() {
        let base = Role::input_file().optional().times(0..10);
        assert!(Role::input_file()
            .times(1..5)
            .no_less_restrictive_than(&base));
        // Widening the multiplicity is illegal.
        assert!(!Role::input_file()
            .optional()
            .times(0..11)
            .no_less_restrictive_than(&base));
        // Dropping required is illegal.
        let required_base = Role::input_file().times(1..2);
        assert!(!Role::input_file()
            .optional()
            .times(1..2)
            .no_less_restrictive_than(&required_base));
        // Category and explicitness must not change.
        assert!(!Role::output_file().no_less_restrictive_than(&Role::input_file()));
        assert!(!Role::input_file()
            .nonexplicit()
            .no_less_restrictive_than(&Role::input_file()));
    }

    #[test]
    fn declaration_checks() {
        assert!(Role::env_var("A", "x", "x").unwrap().check_declaration().is_ok());
        assert!(Role::env_var("A", "x", "x")
            .unwrap()
            .times(1..)
            .check_declaration()
            .is_err());
        assert!(Role::output_object().check_declaration().is_ok());
    }

    #[test]
    fn param_canonical_encoding_is_stable() {
        let a = ParamValue::Seq(vec![
            ParamValue::Int(1),
            ParamValue::Str("x".to_string()),
            ParamValue::None,
        ]);
        let b = ParamValue::Seq(vec![
            ParamValue::Int(1),
            ParamValue::Str("x".to_string()),
            ParamValue::None,
        ]);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_ne!(
            a.canonical_bytes(),
            ParamValue::Seq(vec![ParamValue::Int(2)]).canonical_bytes()
        );
        // Int 1 and Bool true do not collide.
        assert_ne!(
            ParamValue::Int(1).canonical_bytes(),
            ParamValue::Bool(true).canonical_bytes()
        );
    }
}

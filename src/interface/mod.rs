//! Interface declaration registry
//!
//! D-Bus interfaces are declared once, at process startup, through a builder
//! that derives every method/signal/property wire signature from a structural
//! [`TypeDecl`] description. Declarations are sealed by [`InterfaceBuilder::end`]
//! and immutable afterwards; the process-wide registry hands out the same
//! `Arc<Interface>` for the life of the process. Declaring a name twice
//! returns the existing, already-sealed declaration.
//!
//! ## Example
//!
//! ```rust
//! use dbus_client_core::interface::{registry, MethodArg};
//!
//! let iface = registry()
//!     .builder("org.example.Calc")
//!     .add_method("Add", [MethodArg::input("i"), MethodArg::input("i"), MethodArg::output("i")])
//!     .add_signal("Overflowed", ["i"])
//!     .add_property("Precision", "u")
//!     .end()
//!     .unwrap();
//!
//! assert_eq!(iface.method("Add").unwrap().in_signature, "ii");
//! assert_eq!(iface.method("Add").unwrap().out_signature, "i");
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, info};

use crate::error::{DBusError, Result};
use crate::types::{is_basic_type, is_single_complete_type};

/// Structural description of a D-Bus type, converted to a textual signature
/// by [`signature_of`].
#[derive(Debug, Clone)]
pub enum TypeDecl {
    /// A literal signature fragment, e.g. `"s"` or `"a{sv}"`
    Sig(String),
    /// `[T]` - array of one element type
    Array(Box<TypeDecl>),
    /// `[K, V]` with a basic key - dictionary
    Dict(Box<TypeDecl>, Box<TypeDecl>),
    /// Named fields - struct (field order is wire order)
    Struct(Vec<(String, TypeDecl)>),
    /// A self-describing value
    Variant,
}

impl TypeDecl {
    pub fn array(elem: impl Into<TypeDecl>) -> Self {
        TypeDecl::Array(Box::new(elem.into()))
    }

    pub fn dict(key: impl Into<TypeDecl>, value: impl Into<TypeDecl>) -> Self {
        TypeDecl::Dict(Box::new(key.into()), Box::new(value.into()))
    }

    pub fn structure<I, S, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<TypeDecl>,
    {
        TypeDecl::Struct(
            fields
                .into_iter()
                .map(|(name, decl)| (name.into(), decl.into()))
                .collect(),
        )
    }
}

impl From<&str> for TypeDecl {
    fn from(sig: &str) -> Self {
        TypeDecl::Sig(sig.to_string())
    }
}

impl From<String> for TypeDecl {
    fn from(sig: String) -> Self {
        TypeDecl::Sig(sig)
    }
}

/// Derive the textual signature for a structural type description.
///
/// # Errors
///
/// `InvalidSignature` when a literal fragment is not a single complete type,
/// a dict key is not basic, or a struct has no fields.
pub fn signature_of(decl: &TypeDecl) -> Result<String> {
    match decl {
        TypeDecl::Sig(sig) => {
            if !is_single_complete_type(sig) {
                return Err(DBusError::invalid_signature(format!(
                    "{sig:?} is not a single complete type"
                )));
            }
            Ok(sig.clone())
        }
        TypeDecl::Array(elem) => Ok(format!("a{}", signature_of(elem)?)),
        TypeDecl::Dict(key, value) => {
            let key_sig = signature_of(key)?;
            if key_sig.len() != 1 || !is_basic_type(key_sig.as_bytes()[0]) {
                return Err(DBusError::invalid_signature(format!(
                    "dict key {key_sig:?} is not a basic type"
                )));
            }
            Ok(format!("a{{{}{}}}", key_sig, signature_of(value)?))
        }
        TypeDecl::Struct(fields) => {
            if fields.is_empty() {
                return Err(DBusError::invalid_signature(
                    "struct declaration has no fields".to_string(),
                ));
            }
            let mut sig = String::from("(");
            for (_, field) in fields {
                sig.push_str(&signature_of(field)?);
            }
            sig.push(')');
            Ok(sig)
        }
        TypeDecl::Variant => Ok("v".to_string()),
    }
}

/// Direction of a method argument.
///
/// Being an enum, an argument can never be both IN and OUT; the invalid
/// state is unrepresentable rather than checked at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One declared method argument.
#[derive(Debug, Clone)]
pub struct MethodArg {
    pub direction: Direction,
    pub decl: TypeDecl,
}

impl MethodArg {
    /// An argument the caller supplies.
    pub fn input(decl: impl Into<TypeDecl>) -> Self {
        Self {
            direction: Direction::In,
            decl: decl.into(),
        }
    }

    /// An argument the reply carries.
    pub fn output(decl: impl Into<TypeDecl>) -> Self {
        Self {
            direction: Direction::Out,
            decl: decl.into(),
        }
    }
}

/// A sealed method descriptor.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    /// Concatenated signatures of the IN arguments ("" for none)
    pub in_signature: String,
    /// Concatenated signatures of the OUT arguments ("" for none)
    pub out_signature: String,
    /// Structural OUT descriptions, kept for shape reconstruction
    pub out_decls: Vec<TypeDecl>,
}

/// A sealed signal descriptor.
#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub signature: String,
}

/// A sealed property descriptor.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub signature: String,
}

/// An immutable, named set of method/signal/property descriptors.
#[derive(Debug)]
pub struct Interface {
    pub name: String,
    methods: HashMap<String, Method>,
    signals: HashMap<String, Signal>,
    properties: HashMap<String, Property>,
}

impl Interface {
    pub fn method(&self, name: &str) -> Result<&Method> {
        self.methods
            .get(name)
            .ok_or_else(|| DBusError::UnknownMethod(format!("{}.{}", self.name, name)))
    }

    pub fn signal(&self, name: &str) -> Result<&Signal> {
        self.signals
            .get(name)
            .ok_or_else(|| DBusError::UnknownSignal(format!("{}.{}", self.name, name)))
    }

    pub fn property(&self, name: &str) -> Result<&Property> {
        self.properties
            .get(name)
            .ok_or_else(|| DBusError::UnknownProperty(format!("{}.{}", self.name, name)))
    }

    /// Property lookup that tolerates unknown names (raw pass-through path).
    pub fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }
}

/// Accumulates descriptors for one interface; consumed by [`end`].
///
/// Declaration errors (bad type declarations, duplicate members) are held
/// until `end()` so the fluent chain stays ergonomic.
///
/// [`end`]: InterfaceBuilder::end
pub struct InterfaceBuilder<'r> {
    registry: &'r InterfaceRegistry,
    name: String,
    methods: HashMap<String, Method>,
    signals: HashMap<String, Signal>,
    properties: HashMap<String, Property>,
    error: Option<DBusError>,
}

impl InterfaceBuilder<'_> {
    /// Declare a method from directed argument descriptions.
    ///
    /// IN declarations concatenate into the input signature, OUT
    /// declarations into the output signature.
    pub fn add_method(
        mut self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = MethodArg>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let name = name.into();
        let mut in_signature = String::new();
        let mut out_signature = String::new();
        let mut out_decls = Vec::new();
        for arg in args {
            match signature_of(&arg.decl) {
                Ok(sig) => match arg.direction {
                    Direction::In => in_signature.push_str(&sig),
                    Direction::Out => {
                        out_signature.push_str(&sig);
                        out_decls.push(arg.decl);
                    }
                },
                Err(err) => {
                    self.error = Some(err);
                    return self;
                }
            }
        }
        if self.methods.contains_key(&name) {
            self.error = Some(DBusError::invalid_argument(format!(
                "method {}.{name} declared twice",
                self.name
            )));
            return self;
        }
        self.methods.insert(
            name.clone(),
            Method {
                name,
                in_signature,
                out_signature,
                out_decls,
            },
        );
        self
    }

    /// Declare a signal; the declarations concatenate into one signature.
    pub fn add_signal<I, T>(mut self, name: impl Into<String>, decls: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeDecl>,
    {
        if self.error.is_some() {
            return self;
        }
        let name = name.into();
        let mut signature = String::new();
        for decl in decls {
            match signature_of(&decl.into()) {
                Ok(sig) => signature.push_str(&sig),
                Err(err) => {
                    self.error = Some(err);
                    return self;
                }
            }
        }
        if self.signals.contains_key(&name) {
            self.error = Some(DBusError::invalid_argument(format!(
                "signal {}.{name} declared twice",
                self.name
            )));
            return self;
        }
        self.signals.insert(name.clone(), Signal { name, signature });
        self
    }

    /// Declare a property with a single type declaration.
    pub fn add_property(mut self, name: impl Into<String>, decl: impl Into<TypeDecl>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let name = name.into();
        match signature_of(&decl.into()) {
            Ok(signature) => {
                if self.properties.contains_key(&name) {
                    self.error = Some(DBusError::invalid_argument(format!(
                        "property {}.{name} declared twice",
                        self.name
                    )));
                } else {
                    self.properties
                        .insert(name.clone(), Property { name, signature });
                }
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Seal the declaration and register it.
    ///
    /// If the interface name is already registered, the existing sealed
    /// declaration is returned and this builder's contents are discarded —
    /// interfaces are process singletons.
    pub fn end(self) -> Result<Arc<Interface>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut interfaces = self
            .registry
            .interfaces
            .write()
            .expect("interface registry lock poisoned");
        if let Some(existing) = interfaces.get(&self.name) {
            debug!(interface = %self.name, "interface already registered, reusing");
            return Ok(existing.clone());
        }
        info!(
            interface = %self.name,
            methods = self.methods.len(),
            signals = self.signals.len(),
            properties = self.properties.len(),
            "registered interface"
        );
        let iface = Arc::new(Interface {
            name: self.name.clone(),
            methods: self.methods,
            signals: self.signals,
            properties: self.properties,
        });
        interfaces.insert(self.name, iface.clone());
        Ok(iface)
    }
}

/// Registry of sealed interface declarations, keyed by interface name.
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<String, Arc<Interface>>>,
}

impl InterfaceRegistry {
    /// An empty registry without the standard interfaces (tests use this).
    pub fn new() -> Self {
        Self {
            interfaces: RwLock::new(HashMap::new()),
        }
    }

    /// Start declaring an interface.
    pub fn builder(&self, name: impl Into<String>) -> InterfaceBuilder<'_> {
        InterfaceBuilder {
            registry: self,
            name: name.into(),
            methods: HashMap::new(),
            signals: HashMap::new(),
            properties: HashMap::new(),
            error: None,
        }
    }

    /// Look up a sealed declaration.
    pub fn find(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces
            .read()
            .expect("interface registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Look up a sealed declaration, failing with `UnknownInterface`.
    pub fn lookup(&self, name: &str) -> Result<Arc<Interface>> {
        self.find(name)
            .ok_or_else(|| DBusError::UnknownInterface(name.to_string()))
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry, with the standard D-Bus interfaces already
/// declared on first access.
pub fn registry() -> &'static InterfaceRegistry {
    static REGISTRY: OnceLock<InterfaceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = InterfaceRegistry::new();
        declare_standard_interfaces(&registry)
            .expect("standard interface declarations are well-formed");
        registry
    })
}

/// The message bus interface itself plus the Properties/Peer/Introspectable
/// triple every peer speaks.
fn declare_standard_interfaces(registry: &InterfaceRegistry) -> Result<()> {
    registry
        .builder(crate::message::BUS_INTERFACE)
        .add_method("Hello", [MethodArg::output("s")])
        .add_method("AddMatch", [MethodArg::input("s")])
        .add_method("RemoveMatch", [MethodArg::input("s")])
        .add_method(
            "RequestName",
            [
                MethodArg::input("s"),
                MethodArg::input("u"),
                MethodArg::output("u"),
            ],
        )
        .add_method(
            "ReleaseName",
            [MethodArg::input("s"), MethodArg::output("u")],
        )
        .add_method("ListNames", [MethodArg::output(TypeDecl::array("s"))])
        .add_method(
            "GetNameOwner",
            [MethodArg::input("s"), MethodArg::output("s")],
        )
        .add_method(
            "NameHasOwner",
            [MethodArg::input("s"), MethodArg::output("b")],
        )
        .add_signal("NameOwnerChanged", ["s", "s", "s"])
        .add_signal("NameAcquired", ["s"])
        .add_signal("NameLost", ["s"])
        .end()?;

    registry
        .builder(crate::message::PROPERTIES_INTERFACE)
        .add_method(
            "Get",
            [
                MethodArg::input("s"),
                MethodArg::input("s"),
                MethodArg::output("v"),
            ],
        )
        .add_method(
            "Set",
            [
                MethodArg::input("s"),
                MethodArg::input("s"),
                MethodArg::input("v"),
            ],
        )
        .add_method(
            "GetAll",
            [
                MethodArg::input("s"),
                MethodArg::output(TypeDecl::dict("s", TypeDecl::Variant)),
            ],
        )
        .add_signal(
            "PropertiesChanged",
            [
                TypeDecl::from("s"),
                TypeDecl::dict("s", TypeDecl::Variant),
                TypeDecl::array("s"),
            ],
        )
        .end()?;

    registry
        .builder(crate::message::PEER_INTERFACE)
        .add_method("Ping", [])
        .add_method("GetMachineId", [MethodArg::output("s")])
        .end()?;

    registry
        .builder(crate::message::INTROSPECTABLE_INTERFACE)
        .add_method("Introspect", [MethodArg::output("s")])
        .end()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_signature_derivation() {
        let registry = InterfaceRegistry::new();
        let iface = registry
            .builder("org.example.Test")
            .add_method("Foo", [MethodArg::input("s"), MethodArg::output("i")])
            .end()
            .unwrap();
        let method = iface.method("Foo").unwrap();
        assert_eq!(method.in_signature, "s");
        assert_eq!(method.out_signature, "i");
    }

    #[test]
    fn test_signature_of_structural_decls() {
        assert_eq!(signature_of(&TypeDecl::array("s")).unwrap(), "as");
        assert_eq!(
            signature_of(&TypeDecl::dict("s", TypeDecl::Variant)).unwrap(),
            "a{sv}"
        );
        assert_eq!(
            signature_of(&TypeDecl::structure([("x", "i"), ("y", "i")])).unwrap(),
            "(ii)"
        );
        assert_eq!(
            signature_of(&TypeDecl::array(TypeDecl::structure([
                ("name", TypeDecl::from("s")),
                ("attrs", TypeDecl::dict("s", TypeDecl::Variant)),
            ])))
            .unwrap(),
            "a(sa{sv})"
        );
    }

    #[test]
    fn test_dict_key_must_be_basic() {
        let err = signature_of(&TypeDecl::dict(TypeDecl::Variant, "s")).unwrap_err();
        assert!(matches!(err, DBusError::InvalidSignature(_)));
        let err = signature_of(&TypeDecl::dict("(ii)", "s")).unwrap_err();
        assert!(matches!(err, DBusError::InvalidSignature(_)));
    }

    #[test]
    fn test_leaf_must_be_single_complete() {
        let err = signature_of(&TypeDecl::from("si")).unwrap_err();
        assert!(matches!(err, DBusError::InvalidSignature(_)));
    }

    #[test]
    fn test_reregistration_returns_existing() {
        let registry = InterfaceRegistry::new();
        let first = registry
            .builder("org.example.Singleton")
            .add_method("A", [])
            .end()
            .unwrap();
        let second = registry
            .builder("org.example.Singleton")
            .add_method("B", [])
            .end()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // the second builder's contents were discarded
        assert!(second.method("B").is_err());
        assert!(second.method("A").is_ok());
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = InterfaceRegistry::new();
        assert!(matches!(
            registry.lookup("org.example.Missing"),
            Err(DBusError::UnknownInterface(_))
        ));
        let iface = registry.builder("org.example.Empty").end().unwrap();
        assert!(matches!(
            iface.method("Nope"),
            Err(DBusError::UnknownMethod(_))
        ));
        assert!(matches!(
            iface.signal("Nope"),
            Err(DBusError::UnknownSignal(_))
        ));
        assert!(matches!(
            iface.property("Nope"),
            Err(DBusError::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_standard_interfaces_preregistered() {
        let reg = registry();
        let bus = reg.lookup("org.freedesktop.DBus").unwrap();
        assert_eq!(bus.method("Hello").unwrap().out_signature, "s");
        assert_eq!(bus.method("RequestName").unwrap().in_signature, "su");
        let props = reg.lookup("org.freedesktop.DBus.Properties").unwrap();
        assert_eq!(props.method("GetAll").unwrap().out_signature, "a{sv}");
        assert_eq!(
            props.signal("PropertiesChanged").unwrap().signature,
            "sa{sv}as"
        );
    }
}

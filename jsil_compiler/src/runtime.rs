//! Runtime collaborators called from generated code, and the capability table
//! describing which host (intrinsic) methods the emitter may bind statically.
//!
//! Nothing here is implemented by the compiler: these are the entry points of
//! the dynamic-semantics runtime the emitted code links against.

use serde::Serialize;
use strum::IntoStaticStr;

use crate::bytecode::ClrType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
}

impl ErrorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Error" => ErrorKind::Error,
            "TypeError" => ErrorKind::TypeError,
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
        }
    }
}

/// Host objects and host types known to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IntrinsicKind {
    Console,
    Math,
    Process,
    Json,
    /// Receiver statically known to be a JS string.
    String,
    Array,
    /// Free functions of the global object (`parseInt`, `isNaN`, ...).
    Global,
}

impl IntrinsicKind {
    /// Host objects reachable through a global name.
    pub fn from_global_name(name: &str) -> Option<Self> {
        Some(match name {
            "console" => IntrinsicKind::Console,
            "Math" => IntrinsicKind::Math,
            "process" => IntrinsicKind::Process,
            "JSON" => IntrinsicKind::Json,
            "Array" => IntrinsicKind::Array,
            _ => return None,
        })
    }
}

/// Entry points of the runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, IntoStaticStr)]
pub enum RuntimeFn {
    // Coercions and operators: (object, object) -> object unless noted.
    Add,
    Subtract,
    /// (object, object) -> bool
    LooseEquals,
    /// (object, object) -> bool
    StrictEquals,
    /// (object, object) -> bool
    LessThan,
    /// (object, object) -> bool
    GreaterThan,
    /// (object, object) -> bool
    LessThanOrEqual,
    /// (object, object) -> bool
    GreaterThanOrEqual,
    /// (object) -> float64
    ToNumber,
    /// (object) -> bool
    ToBoolean,
    /// (float64) -> int32, modulo 2^32
    ToInt32,
    /// (object) -> string
    Typeof,
    /// (float64, float64) -> float64
    Pow,
    /// (object, object) -> bool
    In,
    /// (object, object) -> bool
    InstanceOf,

    // Dynamic objects.
    /// () -> object
    NewObject,
    /// (object[]) -> object
    NewArray,
    /// (object, string) -> object
    GetProperty,
    /// (object, string, object) -> object
    SetProperty,
    /// (object, object) -> object
    GetItem,
    /// (object, object, object) -> object
    AssignItem,
    /// (object, string, object[]) -> object
    CallMember,
    /// (object) -> float64
    GetLength,
    /// (object) -> object: array of the enumerable keys, as strings
    GetKeys,
    /// (object[] head, object iterable) -> object[]: `head` followed by the
    /// elements of `iterable`
    ConcatArgs,

    // Closures.
    /// (native fn pointer) -> object; the payload is the JS parameter count.
    NewDelegate(u8),
    /// As `NewDelegate`, for a method that takes the receiver as `this`
    /// after its scope array.
    NewMethodDelegate(u8),
    /// (object delegate, object[] scopes) -> object
    Bind,
    /// (object callee, object[] args) -> object; `this` is undefined
    InvokeWithArgs,
    /// (native fn pointer, object[] scopes) -> object
    CreateSelfDelegate,
    /// (object callee, object[] args) -> object
    Construct,
    /// (object instance, object returned) -> object
    ConstructorResult,

    // Errors.
    /// (object message) -> object
    NewError(ErrorKind),
    /// (object) -> exception
    WrapException,
    /// (exception) -> object
    UnwrapException,

    /// () -> object
    GetIntrinsicGlobal(IntrinsicKind),
    /// () -> object: the JS `null` sentinel
    LoadJsNull,
}

impl RuntimeFn {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IntrinsicMethod {
    pub receiver: IntrinsicKind,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Called on a receiver pushed before the arguments.
    Instance,
    /// No receiver.
    Static,
    /// Property read on the receiver; takes no arguments.
    Getter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Object,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// A single `object[]` holding every argument.
    ParamsArray,
    /// Exactly these parameters; missing arguments are padded with
    /// `undefined`, extra ones are evaluated and dropped.
    Fixed(&'static [ArgKind]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Object,
    String,
    Double,
    Boolean,
}

impl ReturnKind {
    pub fn clr_type(&self) -> Option<ClrType> {
        match self {
            ReturnKind::Void => None,
            ReturnKind::Object => Some(ClrType::Object),
            ReturnKind::String => Some(ClrType::String),
            ReturnKind::Double => Some(ClrType::Double),
            ReturnKind::Boolean => Some(ClrType::Boolean),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub receiver: IntrinsicKind,
    pub name: &'static str,
    pub dispatch: Dispatch,
    pub shape: CallShape,
    pub returns: ReturnKind,
}

impl Capability {
    pub fn method(&self) -> IntrinsicMethod {
        IntrinsicMethod {
            receiver: self.receiver,
            name: self.name,
        }
    }

    pub fn fixed_arity(&self) -> Option<usize> {
        match self.shape {
            CallShape::ParamsArray => None,
            CallShape::Fixed(params) => Some(params.len()),
        }
    }
}

const O: ArgKind = ArgKind::Object;
const D: ArgKind = ArgKind::Double;

macro_rules! cap {
    ($recv:ident . $name:literal, $dispatch:ident, params, $ret:ident) => {
        Capability {
            receiver: IntrinsicKind::$recv,
            name: $name,
            dispatch: Dispatch::$dispatch,
            shape: CallShape::ParamsArray,
            returns: ReturnKind::$ret,
        }
    };
    ($recv:ident . $name:literal, $dispatch:ident, [$($arg:ident),*], $ret:ident) => {
        Capability {
            receiver: IntrinsicKind::$recv,
            name: $name,
            dispatch: Dispatch::$dispatch,
            shape: CallShape::Fixed(&[$($arg),*]),
            returns: ReturnKind::$ret,
        }
    };
}

/// Every host method the emitter may call directly.  Anything not listed is
/// reached through dynamic `CallMember` dispatch.
static CAPABILITIES: &[Capability] = &[
    cap!(Console."log", Instance, params, Void),
    cap!(Console."error", Instance, params, Void),
    cap!(Console."warn", Instance, params, Void),
    cap!(Console."info", Instance, params, Void),
    cap!(Math."floor", Static, [D], Double),
    cap!(Math."ceil", Static, [D], Double),
    cap!(Math."round", Static, [D], Double),
    cap!(Math."trunc", Static, [D], Double),
    cap!(Math."abs", Static, [D], Double),
    cap!(Math."sign", Static, [D], Double),
    cap!(Math."sqrt", Static, [D], Double),
    cap!(Math."pow", Static, [D, D], Double),
    cap!(Math."random", Static, [], Double),
    cap!(Math."max", Static, params, Double),
    cap!(Math."min", Static, params, Double),
    cap!(Process."exit", Instance, [O], Void),
    cap!(Json."stringify", Static, [O], String),
    cap!(Json."parse", Static, [O], Object),
    cap!(String."length", Getter, [], Double),
    cap!(String."charAt", Instance, [O], String),
    cap!(String."charCodeAt", Instance, [O], Double),
    cap!(String."indexOf", Instance, [O, O], Double),
    cap!(String."includes", Instance, [O, O], Boolean),
    cap!(String."startsWith", Instance, [O, O], Boolean),
    cap!(String."endsWith", Instance, [O, O], Boolean),
    cap!(String."slice", Instance, [O, O], String),
    cap!(String."substring", Instance, [O, O], String),
    cap!(String."toUpperCase", Instance, [], String),
    cap!(String."toLowerCase", Instance, [], String),
    cap!(String."trim", Instance, [], String),
    cap!(String."repeat", Instance, [O], String),
    cap!(String."padStart", Instance, [O, O], String),
    cap!(String."split", Instance, [O, O], Object),
    cap!(String."replace", Instance, [O, O], String),
    cap!(Array."constructor", Static, params, Object),
    cap!(Array."isArray", Static, [O], Boolean),
    cap!(Global."parseInt", Static, [O, O], Double),
    cap!(Global."parseFloat", Static, [O], Double),
    cap!(Global."isNaN", Static, [O], Boolean),
    cap!(Global."Number", Static, [O], Double),
    cap!(Global."String", Static, [O], String),
    cap!(Global."Boolean", Static, [O], Boolean),
];

pub fn capability(receiver: IntrinsicKind, name: &str) -> Option<&'static Capability> {
    CAPABILITIES
        .iter()
        .find(|cap| cap.receiver == receiver && cap.name == name)
}

pub fn capabilities() -> &'static [Capability] {
    CAPABILITIES
}

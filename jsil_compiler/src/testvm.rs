//! A reference evaluator for compiled assemblies.
//!
//! Runs the entry point against a small model of the runtime library and of
//! the host capabilities, collecting console output.  Tests use it to check
//! what a compiled program does rather than which instructions it contains,
//! which is what makes different compilation paths comparable.
//!
//! Malformed bytecode (stack underflow, unknown labels, unbalanced regions)
//! panics: it is a compiler bug, never a JS-level error.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::bytecode::{Assembly, ClrType, FieldHandle, Instr, Label, MethodHandle, MethodRef, TypeHandle, Visibility};
use crate::runtime::{capability, CallShape, Dispatch, ErrorKind, IntrinsicKind, IntrinsicMethod, ReturnKind, RuntimeFn};

const MAX_CALL_DEPTH: usize = 200;

#[derive(Clone, Debug)]
pub(crate) enum Value {
    /// The null reference: JS `undefined`.
    Null,
    /// The boxed JS `null` sentinel.
    JsNull,
    /// A float64, boxed or not.
    Num(f64),
    /// An unboxed int32 or bool.
    Int(i32),
    /// A boxed bool.
    Bool(bool),
    Str(Rc<str>),
    Object(Rc<RefCell<Object>>),
    /// Both `object[]` and JS arrays.
    Array(Rc<RefCell<Vec<Value>>>),
    Function(Rc<Function>),
    FnPtr(MethodHandle),
    Host(IntrinsicKind),
    Exception(Rc<Value>),
}

#[derive(Debug, Default)]
pub(crate) struct Object {
    class: Option<TypeHandle>,
    fields: BTreeMap<FieldHandle, Value>,
    props: Vec<(String, Value)>,
    error: Option<ErrorKind>,
}

#[derive(Debug)]
pub(crate) struct Function {
    method: MethodHandle,
    /// Bound by `Bind` or a self delegate.
    scopes: Option<Value>,
    /// Object literal methods receive `this` after the scope array.
    takes_this: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed,
    Exit(i32),
    /// An exception reached the entry point.
    Uncaught(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Run {
    pub output: Vec<String>,
    pub outcome: Outcome,
}

impl Run {
    pub fn text(&self) -> String {
        self.output.join("\n")
    }
}

/// Run the assembly's entry point to completion.
pub(crate) fn run(asm: &Assembly) -> Run {
    let entry = asm.entry_point().expect("assembly has no entry point");
    let mut vm = Vm {
        asm,
        statics: HashMap::new(),
        prepared: HashMap::new(),
        output: Vec::new(),
        depth: 0,
    };
    let outcome = match vm.invoke(entry, Vec::new()) {
        Ok(_) => Outcome::Completed,
        Err(Unwind::Exit(code)) => Outcome::Exit(code),
        Err(Unwind::Throw(value)) => Outcome::Uncaught(vm.to_string(&value)),
    };
    Run {
        output: vm.output,
        outcome,
    }
}

#[derive(Debug)]
enum Unwind {
    Throw(Value),
    Exit(i32),
}

type Completion<T> = std::result::Result<T, Unwind>;

fn new_error(kind: ErrorKind, message: &str) -> Value {
    Value::Object(Rc::new(RefCell::new(Object {
        props: vec![("message".to_string(), Value::Str(message.into()))],
        error: Some(kind),
        ..Default::default()
    })))
}

fn throw(kind: ErrorKind, message: &str) -> Unwind {
    Unwind::Throw(new_error(kind, message))
}

#[derive(Debug, Clone, Copy)]
struct Region {
    catch: Option<usize>,
    finally: Option<usize>,
    end: usize,
}

/// Label positions and protected regions of a body, keyed by the index of
/// their `BeginTry`.
struct Prepared {
    labels: HashMap<Label, usize>,
    regions: HashMap<usize, Region>,
}

impl Prepared {
    fn new(instrs: &[Instr]) -> Self {
        let mut labels = HashMap::new();
        let mut regions = HashMap::new();
        let mut open: Vec<(usize, Option<usize>, Option<usize>)> = Vec::new();
        for (ndx, instr) in instrs.iter().enumerate() {
            match instr {
                Instr::Label(label) => {
                    labels.insert(*label, ndx);
                }
                Instr::BeginTry => open.push((ndx, None, None)),
                Instr::BeginCatch => open.last_mut().expect("catch outside of a try").1 = Some(ndx),
                Instr::BeginFinally => open.last_mut().expect("finally outside of a try").2 = Some(ndx),
                Instr::EndTry => {
                    let (start, catch, finally) = open.pop().expect("unbalanced EndTry");
                    regions.insert(start, Region { catch, finally, end: ndx });
                }
                _ => {}
            }
        }
        assert!(open.is_empty(), "unterminated try region");
        Prepared { labels, regions }
    }

    fn target(&self, label: &Label) -> usize {
        *self.labels.get(label).unwrap_or_else(|| panic!("unknown label {:?}", label))
    }
}

enum Flow {
    Fallthrough,
    /// Leaving the current block for the instruction at this index.
    Leave(usize),
    Return(Option<Value>),
}

struct Frame<'a> {
    instrs: &'a [Instr],
    prepared: Rc<Prepared>,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    returns_value: bool,
}

impl<'a> Frame<'a> {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("evaluation stack underflow")
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().checked_sub(n).expect("evaluation stack underflow");
        self.stack.split_off(at)
    }

    fn pop_int(&mut self) -> i32 {
        match self.pop() {
            Value::Int(x) => x,
            other => panic!("expected an int32, got {:?}", other),
        }
    }
}

fn default_value(ty: &ClrType) -> Value {
    match ty {
        ClrType::Double => Value::Num(0.0),
        ClrType::Boolean => Value::Int(0),
        _ => Value::Null,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(x) => Some(*x != 0),
        _ => None,
    }
}

fn is_nullish(value: &Value) -> bool {
    matches!(value, Value::Null | Value::JsNull)
}

fn is_object(value: &Value) -> bool {
    matches!(
        value,
        Value::Object(_) | Value::Array(_) | Value::Function(_) | Value::FnPtr(_) | Value::Host(_)
    )
}

fn array_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.borrow().clone(),
        other => panic!("expected an array, got {:?}", other),
    }
}

fn array_get(value: &Value, index: usize) -> Value {
    match value {
        Value::Array(items) => items.borrow().get(index).cloned().unwrap_or(Value::Null),
        other => panic!("expected an array, got {:?}", other),
    }
}

fn set_index(items: &mut Vec<Value>, index: usize, value: Value) {
    if index >= items.len() {
        items.resize(index + 1, Value::Null);
    }
    items[index] = value;
}

fn as_index(x: f64) -> Option<usize> {
    (x >= 0.0 && x.fract() == 0.0 && x < u32::MAX as f64).then_some(x as usize)
}

fn to_boolean(value: &Value) -> bool {
    match value {
        Value::Null | Value::JsNull => false,
        Value::Num(x) => *x != 0.0 && !x.is_nan(),
        Value::Int(x) => *x != 0,
        Value::Bool(b) => *b,
        Value::Str(s) => !s.is_empty(),
        Value::Exception(inner) => to_boolean(inner),
        _ => true,
    }
}

/// JS ToInt32: modulo 2^32.
fn to_int32(x: f64) -> i32 {
    if !x.is_finite() {
        return 0;
    }
    x.trunc().rem_euclid(4294967296.0) as u32 as i32
}

fn js_pow(x: f64, y: f64) -> f64 {
    if y.is_nan() || (x.abs() == 1.0 && y.is_infinite()) {
        f64::NAN
    } else {
        x.powf(y)
    }
}

pub(crate) fn format_number(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if x == 0.0 {
        "0".to_string()
    } else if x.abs() >= 1e21 || x.abs() < 1e-6 {
        let s = format!("{:e}", x);
        match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => s,
        }
    } else {
        format!("{}", x)
    }
}

fn has_letters(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
}

fn string_to_number(s: &str) -> f64 {
    let s = s.trim();
    match s {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_or(f64::NAN, |x| x as f64);
    }
    if has_letters(s) {
        return f64::NAN;
    }
    s.parse().unwrap_or(f64::NAN)
}

fn parse_int(s: &str, radix: f64) -> f64 {
    let s = s.trim_start();
    let (negative, mut s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut radix = if radix.is_nan() || radix == 0.0 { 0 } else { radix as u32 };
    if radix == 0 || radix == 16 {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: Vec<u32> = s.chars().map_while(|c| c.to_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits.iter().fold(0.0, |acc, d| acc * radix as f64 + *d as f64);
    if negative {
        -value
    } else {
        value
    }
}

/// The longest numeric prefix.
fn parse_float(s: &str) -> f64 {
    let s = s.trim_start();
    for (prefix, value) in [
        ("Infinity", f64::INFINITY),
        ("+Infinity", f64::INFINITY),
        ("-Infinity", f64::NEG_INFINITY),
    ] {
        if s.starts_with(prefix) {
            return value;
        }
    }
    let ends = s.char_indices().map(|(ndx, _)| ndx).skip(1).chain(std::iter::once(s.len()));
    let mut best = f64::NAN;
    for end in ends {
        let prefix = &s[..end];
        if has_letters(prefix) {
            break;
        }
        if let Ok(x) = prefix.parse::<f64>() {
            best = x;
        }
    }
    best
}

fn nth(args: &[Value], ndx: usize) -> Value {
    args.get(ndx).cloned().unwrap_or(Value::Null)
}

fn runtime_arity(func: RuntimeFn) -> usize {
    use RuntimeFn::*;
    match func {
        NewObject | GetIntrinsicGlobal(_) | LoadJsNull => 0,
        ToNumber | ToBoolean | ToInt32 | Typeof | NewArray | GetLength | GetKeys | NewDelegate(_)
        | NewMethodDelegate(_) | NewError(_) | WrapException | UnwrapException => 1,
        Add | Subtract | LooseEquals | StrictEquals | LessThan | GreaterThan | LessThanOrEqual
        | GreaterThanOrEqual | Pow | In | InstanceOf | GetProperty | GetItem | ConcatArgs | Bind
        | CreateSelfDelegate | InvokeWithArgs | Construct | ConstructorResult => 2,
        SetProperty | AssignItem | CallMember => 3,
    }
}

struct Vm<'a> {
    asm: &'a Assembly,
    statics: HashMap<FieldHandle, Value>,
    prepared: HashMap<MethodHandle, Rc<Prepared>>,
    output: Vec<String>,
    depth: usize,
}

impl<'a> Vm<'a> {
    fn invoke(&mut self, method: MethodHandle, args: Vec<Value>) -> Completion<Option<Value>> {
        let asm = self.asm;
        let def = asm.method(method);
        let body = def
            .body
            .as_ref()
            .unwrap_or_else(|| panic!("method {} has no body", def.name));
        let expected = def.sig.params.len() + def.sig.has_this as usize;
        assert_eq!(args.len(), expected, "argument count of {}", def.name);
        if self.depth >= MAX_CALL_DEPTH {
            return Err(throw(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }

        let prepared = Rc::clone(
            self.prepared
                .entry(method)
                .or_insert_with(|| Rc::new(Prepared::new(&body.instrs))),
        );
        let mut frame = Frame {
            instrs: &body.instrs,
            prepared,
            args,
            locals: body.locals.iter().map(default_value).collect(),
            stack: Vec::new(),
            returns_value: def.sig.ret.is_some(),
        };

        self.depth += 1;
        let flow = self.exec_block(&mut frame, 0, body.instrs.len());
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Fallthrough => Ok(None),
            Flow::Leave(target) => panic!("{} leaves to {} outside of its body", def.name, target),
        }
    }

    /// Execute `[start, end)` of the frame's body.
    fn exec_block(&mut self, frame: &mut Frame<'a>, start: usize, end: usize) -> Completion<Flow> {
        let instrs = frame.instrs;
        let prepared = Rc::clone(&frame.prepared);
        let mut pc = start;

        while pc < end {
            let instr = &instrs[pc];
            pc += 1;
            match instr {
                Instr::Nop | Instr::Label(_) => {}

                Instr::LdcR8(x) => frame.push(Value::Num(*x)),
                Instr::LdcI4(x) => frame.push(Value::Int(*x)),
                Instr::Ldstr(s) => frame.push(Value::Str(s.as_str().into())),
                Instr::Ldnull => frame.push(Value::Null),

                Instr::Ldloc(ndx) => {
                    let value = frame.locals[ndx.0 as usize].clone();
                    frame.push(value);
                }
                Instr::Stloc(ndx) => {
                    let value = frame.pop();
                    frame.locals[ndx.0 as usize] = value;
                }
                Instr::Ldarg(ndx) => {
                    let value = frame.args[ndx.0 as usize].clone();
                    frame.push(value);
                }
                Instr::Starg(ndx) => {
                    let value = frame.pop();
                    frame.args[ndx.0 as usize] = value;
                }
                Instr::Ldfld(field) => {
                    let obj = frame.pop();
                    let value = self.load_field(&obj, *field);
                    frame.push(value);
                }
                Instr::Stfld(field) => {
                    let value = frame.pop();
                    let obj = frame.pop();
                    match obj {
                        Value::Object(obj) => {
                            obj.borrow_mut().fields.insert(*field, value);
                        }
                        other => panic!("stfld on {:?}", other),
                    }
                }
                Instr::Ldsfld(field) => {
                    let value = self
                        .statics
                        .get(field)
                        .cloned()
                        .unwrap_or_else(|| default_value(&self.asm.field(*field).ty));
                    frame.push(value);
                }
                Instr::Stsfld(field) => {
                    let value = frame.pop();
                    self.statics.insert(*field, value);
                }
                Instr::LdFrame { index, .. } => {
                    let scopes = frame.pop();
                    frame.push(array_get(&scopes, *index as usize));
                }

                Instr::Box(ty) => {
                    let value = frame.pop();
                    frame.push(match (ty, value) {
                        (ClrType::Boolean, Value::Int(x)) => Value::Bool(x != 0),
                        (_, value) => value,
                    });
                }
                Instr::UnboxAny(ty) => {
                    let value = frame.pop();
                    frame.push(match (ty, value) {
                        (ClrType::Boolean, Value::Bool(b)) => Value::Int(b as i32),
                        (ClrType::Double, Value::Num(x)) => Value::Num(x),
                        (ClrType::Boolean | ClrType::Double, _) => {
                            return Err(throw(ErrorKind::TypeError, "invalid unbox"));
                        }
                        (_, value) => value,
                    });
                }
                Instr::Castclass(ty) => {
                    let value = frame.pop();
                    if !matches!(value, Value::Null) && !self.is_instance(&value, *ty) {
                        return Err(throw(ErrorKind::TypeError, "invalid cast"));
                    }
                    frame.push(value);
                }
                Instr::Isinst(ty) => {
                    let value = frame.pop();
                    let matches = self.is_of_type(&value, ty);
                    frame.push(if matches { value } else { Value::Null });
                }

                Instr::Dup => {
                    let value = frame.stack.last().cloned().expect("evaluation stack underflow");
                    frame.push(value);
                }
                Instr::Pop => {
                    frame.pop();
                }

                Instr::Add | Instr::Sub | Instr::Mul | Instr::Div | Instr::Rem => {
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(arith(instr, a, b));
                }
                Instr::Neg => {
                    let value = match frame.pop() {
                        Value::Num(x) => Value::Num(-x),
                        Value::Int(x) => Value::Int(x.wrapping_neg()),
                        other => panic!("neg of {:?}", other),
                    };
                    frame.push(value);
                }
                Instr::Not => {
                    let x = frame.pop_int();
                    frame.push(Value::Int(!x));
                }
                Instr::And | Instr::Or | Instr::Xor | Instr::Shl | Instr::Shr | Instr::ShrUn => {
                    let b = frame.pop_int();
                    let a = frame.pop_int();
                    let shift = (b as u32) & 31;
                    frame.push(Value::Int(match instr {
                        Instr::And => a & b,
                        Instr::Or => a | b,
                        Instr::Xor => a ^ b,
                        Instr::Shl => a.wrapping_shl(shift),
                        Instr::Shr => a.wrapping_shr(shift),
                        _ => ((a as u32) >> shift) as i32,
                    }));
                }

                Instr::Ceq | Instr::Cgt | Instr::CgtUn | Instr::Clt | Instr::CltUn => {
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(Value::Int(compare(instr, &a, &b) as i32));
                }

                Instr::ConvI4 => {
                    let value = match frame.pop() {
                        Value::Num(x) => x as i32,
                        Value::Int(x) => x,
                        other => panic!("conv.i4 of {:?}", other),
                    };
                    frame.push(Value::Int(value));
                }
                Instr::ConvU4 => {
                    let value = match frame.pop() {
                        Value::Num(x) => x as u32 as i32,
                        Value::Int(x) => x,
                        other => panic!("conv.u4 of {:?}", other),
                    };
                    frame.push(Value::Int(value));
                }
                Instr::ConvR8 => {
                    let value = match frame.pop() {
                        Value::Num(x) => x,
                        Value::Int(x) => x as f64,
                        other => panic!("conv.r8 of {:?}", other),
                    };
                    frame.push(Value::Num(value));
                }
                Instr::ConvRUn => {
                    let value = match frame.pop() {
                        Value::Num(x) => x,
                        Value::Int(x) => x as u32 as f64,
                        other => panic!("conv.r.un of {:?}", other),
                    };
                    frame.push(Value::Num(value));
                }

                Instr::Br(label) => pc = prepared.target(label),
                Instr::Brtrue(label) | Instr::Brfalse(label) => {
                    let taken = match frame.pop() {
                        Value::Int(x) => x != 0,
                        Value::Null => false,
                        _ => true,
                    };
                    if taken == matches!(instr, Instr::Brtrue(_)) {
                        pc = prepared.target(label);
                    }
                }

                Instr::Call(target) => self.call(frame, target, false)?,
                Instr::Callvirt(target) => self.call(frame, target, true)?,
                Instr::Newobj(MethodRef::User(ctor)) => {
                    let def = self.asm.method(*ctor);
                    let mut args = frame.pop_n(def.sig.params.len());
                    let instance = Value::Object(Rc::new(RefCell::new(Object {
                        class: def.owner,
                        ..Default::default()
                    })));
                    args.insert(0, instance.clone());
                    self.invoke(*ctor, args)?;
                    frame.push(instance);
                }
                Instr::Newobj(other) => panic!("newobj of {:?}", other),
                Instr::Ldftn(method) => frame.push(Value::FnPtr(*method)),

                Instr::Newarr(_) => {
                    let len = frame.pop_int();
                    let len = usize::try_from(len).expect("negative array length");
                    frame.push(Value::Array(Rc::new(RefCell::new(vec![Value::Null; len]))));
                }
                Instr::Ldelem => {
                    let index = frame.pop_int();
                    let array = frame.pop();
                    frame.push(array_get(&array, index as usize));
                }
                Instr::Stelem => {
                    let value = frame.pop();
                    let index = frame.pop_int();
                    match frame.pop() {
                        Value::Array(items) => set_index(&mut items.borrow_mut(), index as usize, value),
                        other => panic!("stelem on {:?}", other),
                    }
                }

                Instr::BeginTry => {
                    let region_start = pc - 1;
                    match self.exec_try(frame, &prepared, region_start)? {
                        Flow::Fallthrough => {
                            let region = prepared.regions[&region_start];
                            pc = region.end + 1;
                        }
                        Flow::Leave(target) if (start..end).contains(&target) => pc = target,
                        other => return Ok(other),
                    }
                }
                Instr::EndFinally => return Ok(Flow::Fallthrough),
                Instr::BeginCatch | Instr::BeginFinally | Instr::EndTry => {
                    panic!("{:?} reached outside of its region at {}", instr, pc - 1)
                }
                Instr::Leave(label) => {
                    let target = prepared.target(label);
                    if (start..end).contains(&target) {
                        pc = target;
                    } else {
                        return Ok(Flow::Leave(target));
                    }
                }

                Instr::Throw => {
                    let value = match frame.pop() {
                        Value::Exception(inner) => (*inner).clone(),
                        other => other,
                    };
                    return Err(Unwind::Throw(value));
                }
                Instr::Ret => {
                    let value = frame.returns_value.then(|| frame.pop());
                    return Ok(Flow::Return(value));
                }
            }
        }
        Ok(Flow::Fallthrough)
    }

    fn exec_try(&mut self, frame: &mut Frame<'a>, prepared: &Prepared, start: usize) -> Completion<Flow> {
        let region = *prepared.regions.get(&start).expect("unbalanced try region");
        let body_end = region.catch.or(region.finally).unwrap_or(region.end);
        let result = self.exec_block(frame, start + 1, body_end);

        let result = match (result, region.catch) {
            (Err(Unwind::Throw(value)), Some(catch)) => {
                frame.stack.clear();
                frame.push(Value::Exception(Rc::new(value)));
                self.exec_block(frame, catch + 1, region.finally.unwrap_or(region.end))
            }
            (result, _) => result,
        };
        if let Err(Unwind::Exit(code)) = result {
            return Err(Unwind::Exit(code));
        }

        if let Some(finally) = region.finally {
            frame.stack.clear();
            match self.exec_block(frame, finally + 1, region.end)? {
                Flow::Fallthrough => {}
                overriding => return Ok(overriding),
            }
        }
        result
    }

    fn call(&mut self, frame: &mut Frame<'a>, target: &MethodRef, virtual_call: bool) -> Completion<()> {
        match target {
            MethodRef::User(method) => {
                let def = self.asm.method(*method);
                let args = frame.pop_n(def.sig.params.len() + def.sig.has_this as usize);
                let method = if virtual_call {
                    self.resolve_virtual(&args[0], *method)
                } else {
                    *method
                };
                let ret = self.invoke(method, args)?;
                if def.sig.ret.is_some() {
                    frame.push(ret.unwrap_or(Value::Null));
                }
            }
            MethodRef::Runtime(func) => {
                let args = frame.pop_n(runtime_arity(*func));
                let value = self.runtime(*func, args)?;
                frame.push(value);
            }
            MethodRef::Intrinsic(method) => {
                let cap = capability(method.receiver, method.name)
                    .unwrap_or_else(|| panic!("unknown intrinsic {:?}", method));
                let args = match cap.shape {
                    CallShape::ParamsArray => {
                        let array = frame.pop();
                        array_items(&array)
                    }
                    CallShape::Fixed(params) => frame.pop_n(params.len()),
                };
                let receiver = match cap.dispatch {
                    Dispatch::Static => None,
                    Dispatch::Instance | Dispatch::Getter => Some(frame.pop()),
                };
                let value = self.intrinsic(*method, receiver, &args)?;
                match cap.returns {
                    ReturnKind::Void => {}
                    ReturnKind::Boolean => frame.push(Value::Int(to_boolean(&value) as i32)),
                    _ => frame.push(value),
                }
            }
        }
        Ok(())
    }

    //
    // Types and fields
    //

    fn class_chain(&self, ty: TypeHandle) -> impl Iterator<Item = TypeHandle> + 'a {
        let asm = self.asm;
        std::iter::successors(Some(ty), move |ty| asm.type_def(*ty).base)
    }

    fn class_of(value: &Value) -> Option<TypeHandle> {
        match value {
            Value::Object(obj) => obj.borrow().class,
            _ => None,
        }
    }

    fn is_instance(&self, value: &Value, ty: TypeHandle) -> bool {
        Self::class_of(value).map_or(false, |class| self.class_chain(class).any(|c| c == ty))
    }

    fn is_of_type(&self, value: &Value, ty: &ClrType) -> bool {
        match ty {
            ClrType::Object => !matches!(value, Value::Null),
            ClrType::Double => matches!(value, Value::Num(_)),
            ClrType::Boolean => matches!(value, Value::Bool(_)),
            ClrType::String => matches!(value, Value::Str(_)),
            ClrType::ObjectArray => matches!(value, Value::Array(_)),
            ClrType::JsNull => matches!(value, Value::JsNull),
            ClrType::Class(class) => self.is_instance(value, *class),
        }
    }

    /// The most derived override of `method` for the receiver's class.
    fn resolve_virtual(&self, receiver: &Value, method: MethodHandle) -> MethodHandle {
        let name = &self.asm.method(method).name;
        let Some(class) = Self::class_of(receiver) else {
            return method;
        };
        self.class_chain(class)
            .find_map(|ty| {
                self.asm.type_def(ty).methods.iter().copied().find(|m| {
                    let def = self.asm.method(*m);
                    def.name == *name && !def.is_static && !def.is_ctor
                })
            })
            .unwrap_or(method)
    }

    fn load_field(&self, obj: &Value, field: FieldHandle) -> Value {
        match obj {
            Value::Object(obj) => obj
                .borrow()
                .fields
                .get(&field)
                .cloned()
                .unwrap_or_else(|| default_value(&self.asm.field(field).ty)),
            other => panic!("ldfld {:?} on {:?}", field, other),
        }
    }

    /// A public instance field reachable by name from JS code.
    fn named_field(&self, class: TypeHandle, name: &str) -> Option<FieldHandle> {
        self.class_chain(class).find_map(|ty| {
            self.asm.type_def(ty).fields.iter().copied().find(|f| {
                let def = self.asm.field(*f);
                def.name == name && !def.is_static && def.visibility == Visibility::Public
            })
        })
    }

    fn named_method(&self, class: TypeHandle, name: &str) -> Option<MethodHandle> {
        self.class_chain(class).find_map(|ty| {
            self.asm.type_def(ty).methods.iter().copied().find(|m| {
                let def = self.asm.method(*m);
                def.name == name && !def.is_static && !def.is_ctor
            })
        })
    }

    /// Own enumerable properties: public fields first, then dynamic ones.
    fn entries(&self, obj: &Object) -> Vec<(String, Value)> {
        let mut entries = Vec::new();
        if let Some(class) = obj.class {
            let mut chain: Vec<_> = self.class_chain(class).collect();
            chain.reverse();
            for ty in chain {
                for field in &self.asm.type_def(ty).fields {
                    let def = self.asm.field(*field);
                    if def.is_static || def.visibility != Visibility::Public {
                        continue;
                    }
                    let value = obj.fields.get(field).cloned().unwrap_or_else(|| default_value(&def.ty));
                    entries.push((def.name.clone(), box_value(value)));
                }
            }
        }
        entries.extend(obj.props.iter().cloned());
        entries
    }

    //
    // JS semantics
    //

    fn to_string(&self, value: &Value) -> String {
        match value {
            Value::Null => "undefined".to_string(),
            Value::JsNull => "null".to_string(),
            Value::Num(x) => format_number(*x),
            Value::Int(_) | Value::Bool(_) => as_bool(value).unwrap_or_default().to_string(),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|item| if is_nullish(item) { String::new() } else { self.to_string(item) })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(obj) => {
                let obj = obj.borrow();
                match obj.error {
                    Some(kind) => {
                        let message = obj
                            .props
                            .iter()
                            .find(|(key, _)| key == "message")
                            .map(|(_, value)| self.to_string(value))
                            .unwrap_or_default();
                        if message.is_empty() {
                            kind.name().to_string()
                        } else {
                            format!("{}: {}", kind.name(), message)
                        }
                    }
                    None => "[object Object]".to_string(),
                }
            }
            Value::Function(_) | Value::FnPtr(_) => "function".to_string(),
            Value::Host(_) => "[object Object]".to_string(),
            Value::Exception(inner) => self.to_string(inner),
        }
    }

    fn to_primitive(&self, value: &Value) -> Value {
        match value {
            Value::Exception(inner) => self.to_primitive(inner),
            value if is_object(value) => Value::Str(self.to_string(value).into()),
            value => value.clone(),
        }
    }

    fn to_number(&self, value: &Value) -> f64 {
        match value {
            Value::Null => f64::NAN,
            Value::JsNull => 0.0,
            Value::Num(x) => *x,
            Value::Int(_) | Value::Bool(_) => as_bool(value).map_or(0.0, |b| b as i32 as f64),
            Value::Str(s) => string_to_number(s),
            Value::Exception(inner) => self.to_number(inner),
            value => string_to_number(&self.to_string(value)),
        }
    }

    fn type_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "undefined",
            Value::Num(_) => "number",
            Value::Int(_) | Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Function(_) | Value::FnPtr(_) => "function",
            Value::Exception(inner) => Self::type_of(inner),
            _ => "object",
        }
    }

    fn strict_equals(a: &Value, b: &Value) -> bool {
        if let (Some(x), Some(y)) = (as_bool(a), as_bool(b)) {
            return x == y;
        }
        match (a, b) {
            (Value::Null, Value::Null) | (Value::JsNull, Value::JsNull) => true,
            (Value::Num(x), Value::Num(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
            (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
            (Value::FnPtr(x), Value::FnPtr(y)) => x == y,
            (Value::Host(x), Value::Host(y)) => x == y,
            _ => false,
        }
    }

    fn loose_equals(&self, a: &Value, b: &Value) -> bool {
        match (is_nullish(a), is_nullish(b)) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            (false, false) => {}
        }
        if as_bool(a).is_some() {
            return self.loose_equals(&Value::Num(self.to_number(a)), b);
        }
        if as_bool(b).is_some() {
            return self.loose_equals(a, &Value::Num(self.to_number(b)));
        }
        match (a, b) {
            (Value::Num(_), Value::Str(_)) | (Value::Str(_), Value::Num(_)) => self.to_number(a) == self.to_number(b),
            _ if is_object(a) && !is_object(b) => self.loose_equals(&self.to_primitive(a), b),
            _ if is_object(b) && !is_object(a) => self.loose_equals(a, &self.to_primitive(b)),
            _ => Self::strict_equals(a, b),
        }
    }

    /// `None` when the operands compare unordered.
    fn less_than(&self, a: &Value, b: &Value) -> Option<bool> {
        let a = self.to_primitive(a);
        let b = self.to_primitive(b);
        if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
            return Some(x < y);
        }
        let (x, y) = (self.to_number(&a), self.to_number(&b));
        if x.is_nan() || y.is_nan() {
            None
        } else {
            Some(x < y)
        }
    }

    fn get_property(&self, obj: &Value, name: &str) -> Completion<Value> {
        Ok(match obj {
            Value::Null | Value::JsNull => {
                let message = format!("Cannot read properties of {} (reading '{}')", self.to_string(obj), name);
                return Err(throw(ErrorKind::TypeError, &message));
            }
            Value::Str(s) => match name {
                "length" => Value::Num(s.encode_utf16().count() as f64),
                _ => match name.parse::<usize>() {
                    Ok(ndx) => s.chars().nth(ndx).map_or(Value::Null, |c| Value::Str(c.to_string().into())),
                    Err(_) => Value::Null,
                },
            },
            Value::Array(items) => match name {
                "length" => Value::Num(items.borrow().len() as f64),
                _ => match name.parse::<usize>() {
                    Ok(ndx) => items.borrow().get(ndx).cloned().unwrap_or(Value::Null),
                    Err(_) => Value::Null,
                },
            },
            Value::Object(obj) => {
                let obj = obj.borrow();
                if let Some((_, value)) = obj.props.iter().find(|(key, _)| key == name) {
                    return Ok(value.clone());
                }
                match (obj.error, obj.class) {
                    (Some(kind), _) if name == "name" => Value::Str(kind.name().into()),
                    (Some(_), _) if name == "message" => Value::Str("".into()),
                    (_, Some(class)) => match self.named_field(class, name) {
                        Some(field) => box_value(
                            obj.fields
                                .get(&field)
                                .cloned()
                                .unwrap_or_else(|| default_value(&self.asm.field(field).ty)),
                        ),
                        None => Value::Null,
                    },
                    _ => Value::Null,
                }
            }
            Value::Exception(inner) => return self.get_property(inner, name),
            _ => Value::Null,
        })
    }

    fn set_property(&self, obj: &Value, name: &str, value: Value) -> Completion<()> {
        match obj {
            Value::Null | Value::JsNull => {
                let message = format!("Cannot set properties of {} (setting '{}')", self.to_string(obj), name);
                return Err(throw(ErrorKind::TypeError, &message));
            }
            Value::Array(items) => {
                let mut items = items.borrow_mut();
                if name == "length" {
                    let len = as_index(self.to_number(&value))
                        .ok_or_else(|| throw(ErrorKind::RangeError, "Invalid array length"))?;
                    items.resize(len, Value::Null);
                } else if let Ok(ndx) = name.parse::<usize>() {
                    set_index(&mut items, ndx, value);
                }
            }
            Value::Object(obj) => {
                let field = obj.borrow().class.and_then(|class| self.named_field(class, name));
                let mut obj = obj.borrow_mut();
                match field {
                    Some(field) => {
                        let value = match self.asm.field(field).ty {
                            ClrType::Double => Value::Num(self.to_number(&value)),
                            ClrType::Boolean => Value::Int(to_boolean(&value) as i32),
                            _ => value,
                        };
                        obj.fields.insert(field, value);
                    }
                    None => match obj.props.iter_mut().find(|(key, _)| key == name) {
                        Some(slot) => slot.1 = value,
                        None => obj.props.push((name.to_string(), value)),
                    },
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn property_key(&self, key: &Value) -> String {
        self.to_string(key)
    }

    fn get_item(&self, obj: &Value, key: &Value) -> Completion<Value> {
        if let (Value::Array(items), Value::Num(x)) = (obj, key) {
            if let Some(ndx) = as_index(*x) {
                return Ok(items.borrow().get(ndx).cloned().unwrap_or(Value::Null));
            }
        }
        self.get_property(obj, &self.property_key(key))
    }

    fn assign_item(&self, obj: &Value, key: &Value, value: Value) -> Completion<()> {
        if let (Value::Array(items), Value::Num(x)) = (obj, key) {
            if let Some(ndx) = as_index(*x) {
                set_index(&mut items.borrow_mut(), ndx, value);
                return Ok(());
            }
        }
        self.set_property(obj, &self.property_key(key), value)
    }

    fn inspect(&self, value: &Value, nested: bool) -> String {
        match value {
            Value::Str(s) if nested => format!("'{}'", s),
            Value::Array(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    return "[]".to_string();
                }
                let parts: Vec<_> = items.iter().map(|item| self.inspect(item, true)).collect();
                format!("[ {} ]", parts.join(", "))
            }
            Value::Object(obj) => {
                let obj = obj.borrow();
                if obj.error.is_some() {
                    drop(obj);
                    return self.to_string(value);
                }
                let prefix = obj
                    .class
                    .map(|class| {
                        let name = &self.asm.type_def(class).name;
                        format!("{} ", name.rsplit('.').next().unwrap_or(name))
                    })
                    .unwrap_or_default();
                let parts: Vec<_> = self
                    .entries(&obj)
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, self.inspect(value, true)))
                    .collect();
                if parts.is_empty() {
                    format!("{}{{}}", prefix)
                } else {
                    format!("{}{{ {} }}", prefix, parts.join(", "))
                }
            }
            Value::Function(_) | Value::FnPtr(_) => "[Function]".to_string(),
            Value::Host(kind) => format!("[{:?}]", kind),
            Value::Exception(inner) => self.inspect(inner, nested),
            other => self.to_string(other),
        }
    }

    //
    // Calls through values
    //

    /// Call a function value.  `this` only reaches object literal methods.
    fn invoke_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> Completion<Value> {
        let Value::Function(function) = callee else {
            let message = format!("{} is not a function", self.inspect(callee, true));
            return Err(throw(ErrorKind::TypeError, &message));
        };
        let def = self.asm.method(function.method);
        let leading = 1 + function.takes_this as usize;
        let mut args = args;
        args.resize(def.sig.params.len().saturating_sub(leading), Value::Null);
        let scopes = function
            .scopes
            .clone()
            .unwrap_or_else(|| Value::Array(Rc::new(RefCell::new(Vec::new()))));
        let mut call_args = vec![scopes];
        if function.takes_this {
            call_args.push(this);
        }
        call_args.extend(args);
        Ok(self.invoke(function.method, call_args)?.unwrap_or(Value::Null))
    }

    fn call_member(&mut self, receiver: Value, name: &str, args: Vec<Value>) -> Completion<Value> {
        match &receiver {
            Value::Array(items) => match name {
                "push" => {
                    let mut items = items.borrow_mut();
                    items.extend(args);
                    return Ok(Value::Num(items.len() as f64));
                }
                "pop" => return Ok(items.borrow_mut().pop().unwrap_or(Value::Null)),
                "join" => {
                    let sep = match nth(&args, 0) {
                        Value::Null => ",".to_string(),
                        sep => self.to_string(&sep),
                    };
                    let parts: Vec<_> = items
                        .borrow()
                        .iter()
                        .map(|item| if is_nullish(item) { String::new() } else { self.to_string(item) })
                        .collect();
                    return Ok(Value::Str(parts.join(sep.as_str()).into()));
                }
                "indexOf" | "includes" => {
                    let needle = nth(&args, 0);
                    let found = items.borrow().iter().position(|item| Self::strict_equals(item, &needle));
                    return Ok(match name {
                        "indexOf" => Value::Num(found.map_or(-1.0, |ndx| ndx as f64)),
                        _ => Value::Bool(found.is_some()),
                    });
                }
                _ => {}
            },
            Value::Str(s) => {
                if let Some(cap) = capability(IntrinsicKind::String, name).filter(|cap| cap.dispatch == Dispatch::Instance) {
                    let value = self.string_method(s, cap.name, &args)?;
                    return Ok(match cap.returns {
                        ReturnKind::Boolean => Value::Bool(to_boolean(&value)),
                        _ => value,
                    });
                }
            }
            Value::Host(kind) => {
                if let Some(cap) = capability(*kind, name).filter(|cap| cap.dispatch != Dispatch::Getter) {
                    let args = match cap.shape {
                        CallShape::ParamsArray => args,
                        CallShape::Fixed(params) => {
                            let mut args = args;
                            args.resize(params.len(), Value::Null);
                            args
                        }
                    };
                    let receiver = (cap.dispatch == Dispatch::Instance).then(|| receiver.clone());
                    let value = self.intrinsic(cap.method(), receiver, &args)?;
                    return Ok(match cap.returns {
                        ReturnKind::Void => Value::Null,
                        ReturnKind::Boolean => Value::Bool(to_boolean(&value)),
                        _ => value,
                    });
                }
            }
            Value::Object(_) => {
                if let Some(method) = Self::class_of(&receiver).and_then(|class| self.named_method(class, name)) {
                    let def = self.asm.method(method);
                    let mut args = args;
                    args.resize(def.sig.params.len(), Value::Null);
                    args.insert(0, receiver.clone());
                    return Ok(self.invoke(method, args)?.unwrap_or(Value::Null));
                }
            }
            _ => {}
        }

        let callee = self.get_property(&receiver, name)?;
        if !matches!(callee, Value::Function(_)) {
            let message = format!("{}.{} is not a function", self.inspect(&receiver, true), name);
            return Err(throw(ErrorKind::TypeError, &message));
        }
        self.invoke_value(&callee, receiver, args)
    }

    //
    // Runtime library
    //

    fn runtime(&mut self, func: RuntimeFn, args: Vec<Value>) -> Completion<Value> {
        let arg = |ndx: usize| nth(&args, ndx);
        let bool_value = |b: bool| Value::Int(b as i32);
        Ok(match func {
            RuntimeFn::Add => {
                let a = self.to_primitive(&arg(0));
                let b = self.to_primitive(&arg(1));
                if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
                    Value::Str(format!("{}{}", self.to_string(&a), self.to_string(&b)).into())
                } else {
                    Value::Num(self.to_number(&a) + self.to_number(&b))
                }
            }
            RuntimeFn::Subtract => Value::Num(self.to_number(&arg(0)) - self.to_number(&arg(1))),
            RuntimeFn::LooseEquals => bool_value(self.loose_equals(&arg(0), &arg(1))),
            RuntimeFn::StrictEquals => bool_value(Self::strict_equals(&arg(0), &arg(1))),
            RuntimeFn::LessThan => bool_value(self.less_than(&arg(0), &arg(1)) == Some(true)),
            RuntimeFn::GreaterThan => bool_value(self.less_than(&arg(1), &arg(0)) == Some(true)),
            RuntimeFn::LessThanOrEqual => bool_value(self.less_than(&arg(1), &arg(0)) == Some(false)),
            RuntimeFn::GreaterThanOrEqual => bool_value(self.less_than(&arg(0), &arg(1)) == Some(false)),
            RuntimeFn::ToNumber => Value::Num(self.to_number(&arg(0))),
            RuntimeFn::ToBoolean => bool_value(to_boolean(&arg(0))),
            RuntimeFn::ToInt32 => Value::Int(to_int32(self.to_number(&arg(0)))),
            RuntimeFn::Typeof => Value::Str(Self::type_of(&arg(0)).into()),
            RuntimeFn::Pow => Value::Num(js_pow(self.to_number(&arg(0)), self.to_number(&arg(1)))),
            RuntimeFn::In => {
                let key = self.property_key(&arg(0));
                let found = match arg(1) {
                    Value::Array(items) => {
                        key == "length" || key.parse::<usize>().map_or(false, |ndx| ndx < items.borrow().len())
                    }
                    Value::Object(obj) => {
                        let obj = obj.borrow();
                        obj.props.iter().any(|(k, _)| *k == key)
                            || obj.class.and_then(|class| self.named_field(class, &key)).is_some()
                    }
                    other if is_object(&other) => false,
                    other => {
                        let message = format!("Cannot use 'in' operator to search for '{}' in {}", key, self.to_string(&other));
                        return Err(throw(ErrorKind::TypeError, &message));
                    }
                };
                bool_value(found)
            }
            RuntimeFn::InstanceOf => match arg(1) {
                Value::Function(_) => bool_value(false),
                _ => return Err(throw(ErrorKind::TypeError, "Right-hand side of 'instanceof' is not callable")),
            },

            RuntimeFn::NewObject => Value::Object(Rc::new(RefCell::new(Object::default()))),
            RuntimeFn::NewArray => Value::Array(Rc::new(RefCell::new(array_items(&arg(0))))),
            RuntimeFn::GetProperty => {
                let name = self.to_string(&arg(1));
                self.get_property(&arg(0), &name)?
            }
            RuntimeFn::SetProperty => {
                let name = self.to_string(&arg(1));
                self.set_property(&arg(0), &name, arg(2))?;
                arg(2)
            }
            RuntimeFn::GetItem => self.get_item(&arg(0), &arg(1))?,
            RuntimeFn::AssignItem => {
                self.assign_item(&arg(0), &arg(1), arg(2))?;
                arg(2)
            }
            RuntimeFn::CallMember => {
                let name = self.to_string(&arg(1));
                self.call_member(arg(0), &name, array_items(&arg(2)))?
            }
            RuntimeFn::GetLength => {
                let length = self.get_property(&arg(0), "length")?;
                Value::Num(self.to_number(&length))
            }
            RuntimeFn::GetKeys => {
                let keys: Vec<String> = match arg(0) {
                    Value::Object(obj) => self.entries(&obj.borrow()).into_iter().map(|(key, _)| key).collect(),
                    Value::Array(items) => (0..items.borrow().len()).map(|ndx| ndx.to_string()).collect(),
                    Value::Str(s) => (0..s.chars().count()).map(|ndx| ndx.to_string()).collect(),
                    _ => Vec::new(),
                };
                let keys = keys.into_iter().map(|key| Value::Str(key.into())).collect();
                Value::Array(Rc::new(RefCell::new(keys)))
            }
            RuntimeFn::ConcatArgs => {
                let mut items = array_items(&arg(0));
                match arg(1) {
                    Value::Array(elems) => items.extend(elems.borrow().iter().cloned()),
                    Value::Str(s) => items.extend(s.chars().map(|c| Value::Str(c.to_string().into()))),
                    other => {
                        let message = format!("{} is not iterable", self.inspect(&other, true));
                        return Err(throw(ErrorKind::TypeError, &message));
                    }
                }
                Value::Array(Rc::new(RefCell::new(items)))
            }

            RuntimeFn::NewDelegate(_) | RuntimeFn::NewMethodDelegate(_) => match arg(0) {
                Value::FnPtr(method) => Value::Function(Rc::new(Function {
                    method,
                    scopes: None,
                    takes_this: matches!(func, RuntimeFn::NewMethodDelegate(_)),
                })),
                other => panic!("delegate over {:?}", other),
            },
            RuntimeFn::Bind => match arg(0) {
                Value::Function(function) => Value::Function(Rc::new(Function {
                    method: function.method,
                    scopes: Some(arg(1)),
                    takes_this: function.takes_this,
                })),
                other => panic!("binding {:?}", other),
            },
            RuntimeFn::CreateSelfDelegate => match arg(0) {
                Value::FnPtr(method) => Value::Function(Rc::new(Function {
                    method,
                    scopes: Some(arg(1)),
                    takes_this: false,
                })),
                other => panic!("self delegate over {:?}", other),
            },
            RuntimeFn::InvokeWithArgs => self.invoke_value(&arg(0), Value::Null, array_items(&arg(1)))?,
            RuntimeFn::Construct => {
                let returned = self.invoke_value(&arg(0), Value::Null, array_items(&arg(1)))?;
                if is_object(&returned) {
                    returned
                } else {
                    Value::Object(Rc::new(RefCell::new(Object::default())))
                }
            }
            RuntimeFn::ConstructorResult => {
                if is_object(&arg(1)) {
                    arg(1)
                } else {
                    arg(0)
                }
            }

            RuntimeFn::NewError(kind) => {
                let message = match arg(0) {
                    Value::Null => String::new(),
                    message => self.to_string(&message),
                };
                new_error(kind, &message)
            }
            RuntimeFn::WrapException => Value::Exception(Rc::new(arg(0))),
            RuntimeFn::UnwrapException => match arg(0) {
                Value::Exception(inner) => (*inner).clone(),
                other => other,
            },

            RuntimeFn::GetIntrinsicGlobal(kind) => Value::Host(kind),
            RuntimeFn::LoadJsNull => Value::JsNull,
        })
    }

    //
    // Host capabilities
    //

    fn intrinsic(&mut self, method: IntrinsicMethod, receiver: Option<Value>, args: &[Value]) -> Completion<Value> {
        if method.receiver == IntrinsicKind::Console {
            let line = args.iter().map(|arg| self.inspect(arg, false)).collect::<Vec<_>>().join(" ");
            self.output.push(line);
            return Ok(Value::Null);
        }

        let num = |ndx: usize| self.to_number(&nth(args, ndx));
        let value = match (method.receiver, method.name) {
            (IntrinsicKind::Math, "floor") => Value::Num(num(0).floor()),
            (IntrinsicKind::Math, "ceil") => Value::Num(num(0).ceil()),
            (IntrinsicKind::Math, "round") => Value::Num((num(0) + 0.5).floor()),
            (IntrinsicKind::Math, "trunc") => Value::Num(num(0).trunc()),
            (IntrinsicKind::Math, "abs") => Value::Num(num(0).abs()),
            (IntrinsicKind::Math, "sign") => {
                let x = num(0);
                Value::Num(if x.is_nan() || x == 0.0 { x } else { x.signum() })
            }
            (IntrinsicKind::Math, "sqrt") => Value::Num(num(0).sqrt()),
            (IntrinsicKind::Math, "pow") => Value::Num(js_pow(num(0), num(1))),
            // Deterministic, so that runs can be compared.
            (IntrinsicKind::Math, "random") => Value::Num(0.5),
            (IntrinsicKind::Math, name @ ("max" | "min")) => {
                let is_max = name == "max";
                let init = if is_max { f64::NEG_INFINITY } else { f64::INFINITY };
                let result = args.iter().map(|arg| self.to_number(arg)).fold(init, |acc, x| {
                    if acc.is_nan() || x.is_nan() {
                        f64::NAN
                    } else if is_max {
                        acc.max(x)
                    } else {
                        acc.min(x)
                    }
                });
                Value::Num(result)
            }

            (IntrinsicKind::Process, "exit") => {
                let code = num(0);
                return Err(Unwind::Exit(if code.is_nan() { 0 } else { code as i32 }));
            }

            (IntrinsicKind::Json, "stringify") => match self.to_json(&nth(args, 0)) {
                Some(json) => Value::Str(json.dump().into()),
                None => Value::Null,
            },
            (IntrinsicKind::Json, "parse") => {
                let text = self.to_string(&nth(args, 0));
                match json::parse(&text) {
                    Ok(json) => from_json(&json),
                    Err(err) => return Err(throw(ErrorKind::SyntaxError, &err.to_string())),
                }
            }

            (IntrinsicKind::String, name) => {
                let receiver = receiver.unwrap_or(Value::Null);
                let s = self.to_string(&receiver);
                self.string_method(&s, name, args)?
            }

            (IntrinsicKind::Array, "constructor") => match args {
                [Value::Num(len)] => {
                    let len = as_index(*len).ok_or_else(|| throw(ErrorKind::RangeError, "Invalid array length"))?;
                    Value::Array(Rc::new(RefCell::new(vec![Value::Null; len])))
                }
                _ => Value::Array(Rc::new(RefCell::new(args.to_vec()))),
            },
            (IntrinsicKind::Array, "isArray") => Value::Bool(matches!(nth(args, 0), Value::Array(_))),

            (IntrinsicKind::Global, "parseInt") => {
                let text = self.to_string(&nth(args, 0));
                Value::Num(parse_int(&text, num(1)))
            }
            (IntrinsicKind::Global, "parseFloat") => Value::Num(parse_float(&self.to_string(&nth(args, 0)))),
            (IntrinsicKind::Global, "isNaN") => Value::Bool(num(0).is_nan()),
            (IntrinsicKind::Global, "Number") => Value::Num(num(0)),
            (IntrinsicKind::Global, "String") => Value::Str(self.to_string(&nth(args, 0)).into()),
            (IntrinsicKind::Global, "Boolean") => Value::Bool(to_boolean(&nth(args, 0))),

            (receiver, name) => panic!("intrinsic {:?}.{} is not modelled", receiver, name),
        };
        Ok(value)
    }

    fn string_method(&self, s: &str, name: &str, args: &[Value]) -> Completion<Value> {
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len() as f64;
        let int_arg = |ndx: usize, default: f64| match nth(args, ndx) {
            Value::Null => default,
            value => {
                let x = self.to_number(&value);
                if x.is_nan() {
                    0.0
                } else {
                    x.trunc()
                }
            }
        };
        let str_arg = |ndx: usize| self.to_string(&nth(args, ndx));
        let clamp = |x: f64| x.max(0.0).min(len) as usize;
        let relative = |x: f64| if x < 0.0 { (len + x).max(0.0) as usize } else { x.min(len) as usize };
        let text = |from: usize, to: usize| chars[from..to].iter().collect::<String>();
        let string = |s: String| Value::Str(s.into());

        Ok(match name {
            "length" => Value::Num(s.encode_utf16().count() as f64),
            "charAt" | "charCodeAt" => {
                let ndx = int_arg(0, 0.0);
                let c = (ndx >= 0.0 && ndx < len).then(|| chars[ndx as usize]);
                match (name, c) {
                    ("charAt", c) => string(c.map(String::from).unwrap_or_default()),
                    (_, Some(c)) => Value::Num(c as u32 as f64),
                    (_, None) => Value::Num(f64::NAN),
                }
            }
            "indexOf" | "includes" => {
                let needle = str_arg(0);
                let from = clamp(int_arg(1, 0.0));
                let haystack = text(from, chars.len());
                let found = haystack.find(&needle).map(|byte| from + haystack[..byte].chars().count());
                match name {
                    "indexOf" => Value::Num(found.map_or(-1.0, |ndx| ndx as f64)),
                    _ => Value::Bool(found.is_some()),
                }
            }
            "startsWith" => {
                let from = clamp(int_arg(1, 0.0));
                Value::Bool(text(from, chars.len()).starts_with(&str_arg(0)))
            }
            "endsWith" => {
                let to = clamp(int_arg(1, len));
                Value::Bool(text(0, to).ends_with(&str_arg(0)))
            }
            "slice" => {
                let from = relative(int_arg(0, 0.0));
                let to = relative(int_arg(1, len));
                string(if from < to { text(from, to) } else { String::new() })
            }
            "substring" => {
                let a = clamp(int_arg(0, 0.0));
                let b = clamp(int_arg(1, len));
                string(text(a.min(b), a.max(b)))
            }
            "toUpperCase" => string(s.to_uppercase()),
            "toLowerCase" => string(s.to_lowercase()),
            "trim" => string(s.trim().to_string()),
            "repeat" => {
                let count = int_arg(0, 0.0);
                if count < 0.0 || count.is_infinite() {
                    let message = format!("Invalid count value: {}", format_number(count));
                    return Err(throw(ErrorKind::RangeError, &message));
                }
                string(s.repeat(count as usize))
            }
            "padStart" => {
                let target = int_arg(0, 0.0).max(0.0) as usize;
                let pad = match nth(args, 1) {
                    Value::Null => " ".to_string(),
                    pad => self.to_string(&pad),
                };
                if pad.is_empty() || chars.len() >= target {
                    string(s.to_string())
                } else {
                    let fill: String = pad.chars().cycle().take(target - chars.len()).collect();
                    string(format!("{}{}", fill, s))
                }
            }
            "split" => {
                let parts: Vec<String> = match nth(args, 0) {
                    Value::Null => vec![s.to_string()],
                    sep => {
                        let sep = self.to_string(&sep);
                        if sep.is_empty() {
                            chars.iter().map(|c| c.to_string()).collect()
                        } else {
                            s.split(sep.as_str()).map(str::to_string).collect()
                        }
                    }
                };
                let limit = match nth(args, 1) {
                    Value::Null => usize::MAX,
                    limit => self.to_number(&limit).max(0.0) as usize,
                };
                let parts = parts.into_iter().take(limit).map(|part| Value::Str(part.into())).collect();
                Value::Array(Rc::new(RefCell::new(parts)))
            }
            "replace" => string(s.replacen(&str_arg(0), &str_arg(1), 1)),
            other => panic!("string method {} is not modelled", other),
        })
    }

    fn to_json(&self, value: &Value) -> Option<json::JsonValue> {
        use json::JsonValue;
        Some(match value {
            Value::Null | Value::Function(_) | Value::FnPtr(_) => return None,
            Value::JsNull => JsonValue::Null,
            Value::Num(x) if x.is_finite() => JsonValue::from(*x),
            Value::Num(_) => JsonValue::Null,
            Value::Int(_) | Value::Bool(_) => JsonValue::Boolean(as_bool(value).unwrap_or_default()),
            Value::Str(s) => JsonValue::String(s.to_string()),
            Value::Array(items) => JsonValue::Array(
                items
                    .borrow()
                    .iter()
                    .map(|item| self.to_json(item).unwrap_or(JsonValue::Null))
                    .collect(),
            ),
            Value::Object(obj) => {
                let mut out = json::object::Object::new();
                for (key, value) in self.entries(&obj.borrow()) {
                    if let Some(value) = self.to_json(&value) {
                        out.insert(&key, value);
                    }
                }
                JsonValue::Object(out)
            }
            Value::Host(_) => JsonValue::Object(json::object::Object::new()),
            Value::Exception(inner) => return self.to_json(inner),
        })
    }
}

/// Typed field contents as seen from JS code.
fn box_value(value: Value) -> Value {
    match value {
        Value::Int(x) => Value::Bool(x != 0),
        value => value,
    }
}

fn from_json(json: &json::JsonValue) -> Value {
    use json::JsonValue;
    match json {
        JsonValue::Null => Value::JsNull,
        JsonValue::Boolean(b) => Value::Bool(*b),
        JsonValue::Number(_) => Value::Num(json.as_f64().unwrap_or(f64::NAN)),
        JsonValue::Short(_) | JsonValue::String(_) => Value::Str(json.as_str().unwrap_or_default().into()),
        JsonValue::Array(items) => Value::Array(Rc::new(RefCell::new(items.iter().map(from_json).collect()))),
        JsonValue::Object(obj) => {
            let props = obj.iter().map(|(key, value)| (key.to_string(), from_json(value))).collect();
            Value::Object(Rc::new(RefCell::new(Object {
                props,
                ..Default::default()
            })))
        }
    }
}

fn arith(instr: &Instr, a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => Value::Num(match instr {
            Instr::Add => x + y,
            Instr::Sub => x - y,
            Instr::Mul => x * y,
            Instr::Div => x / y,
            _ => x % y,
        }),
        (Value::Int(x), Value::Int(y)) => Value::Int(match instr {
            Instr::Add => x.wrapping_add(y),
            Instr::Sub => x.wrapping_sub(y),
            Instr::Mul => x.wrapping_mul(y),
            Instr::Div => x.checked_div(y).expect("int32 division by zero"),
            _ => x.checked_rem(y).expect("int32 division by zero"),
        }),
        (a, b) => panic!("{:?} on {:?} and {:?}", instr, a, b),
    }
}

fn same_ref(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) | (Value::JsNull, Value::JsNull) => true,
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y),
        _ => Vm::strict_equals(a, b) && is_object(a),
    }
}

/// `ceq`/`cgt`/`clt` and their unordered variants.  References compare
/// by identity, non-null above null.
fn compare(instr: &Instr, a: &Value, b: &Value) -> bool {
    let numbers = match (a, b) {
        (Value::Num(x), Value::Num(y)) => Some((*x, *y)),
        (Value::Int(x), Value::Int(y)) => Some((*x as f64, *y as f64)),
        _ => None,
    };
    match (numbers, instr) {
        (Some((x, y)), Instr::Ceq) => x == y,
        (Some((x, y)), Instr::Cgt) => x > y,
        (Some((x, y)), Instr::Clt) => x < y,
        (Some((x, y)), Instr::CgtUn) => !(x <= y),
        (Some((x, y)), Instr::CltUn) => !(x >= y),
        (None, Instr::Ceq) => same_ref(a, b),
        (None, Instr::CgtUn) => !matches!(a, Value::Null) && matches!(b, Value::Null),
        (None, _) => panic!("{:?} on {:?} and {:?}", instr, a, b),
        (Some(_), _) => unreachable!("not a comparison"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(string_to_number(" 42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert!(string_to_number("inf").is_nan());
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert_eq!(parse_int("12px", f64::NAN), 12.0);
        assert_eq!(parse_int("-ff", 16.0), -255.0);
        assert!(parse_int("px", f64::NAN).is_nan());
        assert_eq!(parse_float("3.5e2x"), 350.0);
        assert_eq!(to_int32(4294967297.0), 1);
        assert_eq!(to_int32(-1.0), -1);
    }
}

//! Bytecode instructions

use serde::{Deserialize, Serialize};

use crate::operand::{ConstantIndex, FunctionIndex, JumpOffset, LocalIndex, Register};

/// Register-based instruction set.
///
/// Most instructions take a destination register and one or more source
/// registers or operands. Operator precedence and short-circuit structure
/// are resolved by the (out-of-scope) compiler: `a && b` arrives as a
/// `JumpIfFalse` over the instructions for `b`, which the interpreter must
/// not reorder or speculatively execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // ==================== Constants ====================
    /// dst = undefined
    LoadUndefined {
        /// Destination register
        dst: Register,
    },
    /// dst = null
    LoadNull {
        /// Destination register
        dst: Register,
    },
    /// dst = true
    LoadTrue {
        /// Destination register
        dst: Register,
    },
    /// dst = false
    LoadFalse {
        /// Destination register
        dst: Register,
    },
    /// dst = imm32
    LoadInt32 {
        /// Destination register
        dst: Register,
        /// Immediate value
        value: i32,
    },
    /// dst = constants\[idx\]
    LoadConst {
        /// Destination register
        dst: Register,
        /// Constant pool index
        idx: ConstantIndex,
    },
    /// dst = src
    Move {
        /// Destination register
        dst: Register,
        /// Source register
        src: Register,
    },

    // ==================== Variables ====================
    /// dst = current environment slot
    GetLocal {
        /// Destination register
        dst: Register,
        /// Slot in the current environment frame
        slot: LocalIndex,
    },
    /// current environment slot = src
    SetLocal {
        /// Slot in the current environment frame
        slot: LocalIndex,
        /// Source register
        src: Register,
    },
    /// dst = slot in the environment `depth` frames up the chain
    GetCaptured {
        /// Destination register
        dst: Register,
        /// Frames to walk up the environment chain
        depth: u16,
        /// Slot in the target frame
        slot: LocalIndex,
    },
    /// slot in the environment `depth` frames up the chain = src
    SetCaptured {
        /// Frames to walk up the environment chain
        depth: u16,
        /// Slot in the target frame
        slot: LocalIndex,
        /// Source register
        src: Register,
    },
    /// dst = globals\[name\]; ReferenceError when unbound
    GetGlobal {
        /// Destination register
        dst: Register,
        /// Name (string constant)
        name: ConstantIndex,
    },
    /// globals\[name\] = src
    SetGlobal {
        /// Name (string constant)
        name: ConstantIndex,
        /// Source register
        src: Register,
    },
    /// dst = this
    LoadThis {
        /// Destination register
        dst: Register,
    },
    /// Enter a nested environment frame with `slots` fresh variables.
    /// Each execution creates a distinct frame, so closures made inside a
    /// loop body capture per-iteration bindings.
    PushScope {
        /// Variable slots in the new frame
        slots: u16,
    },
    /// Leave the innermost nested environment frame
    PopScope,

    // ==================== Arithmetic ====================
    /// dst = lhs + rhs (concatenates when either primitive is a string)
    Add {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs - rhs
    Sub {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs * rhs
    Mul {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs / rhs
    Div {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs % rhs
    Mod {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = -src
    Neg {
        /// Destination register
        dst: Register,
        /// Source register
        src: Register,
    },

    // ==================== Comparison ====================
    /// dst = lhs == rhs (loose)
    Eq {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs != rhs (loose)
    Ne {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs === rhs
    StrictEq {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs !== rhs
    StrictNe {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs < rhs
    Lt {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs <= rhs
    Le {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs > rhs
    Gt {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },
    /// dst = lhs >= rhs
    Ge {
        /// Destination register
        dst: Register,
        /// Left operand
        lhs: Register,
        /// Right operand
        rhs: Register,
    },

    // ==================== Logical / Type ====================
    /// dst = !src
    Not {
        /// Destination register
        dst: Register,
        /// Source register
        src: Register,
    },
    /// dst = typeof src
    TypeOf {
        /// Destination register
        dst: Register,
        /// Source register
        src: Register,
    },

    // ==================== Objects & Arrays ====================
    /// dst = {}
    NewObject {
        /// Destination register
        dst: Register,
    },
    /// dst = \[\]
    NewArray {
        /// Destination register
        dst: Register,
    },
    /// dst = obj\[key\]; TypeError when obj is nullish
    GetProp {
        /// Destination register
        dst: Register,
        /// Object register
        obj: Register,
        /// Key register (string, number, or symbol)
        key: Register,
    },
    /// obj\[key\] = src
    SetProp {
        /// Object register
        obj: Register,
        /// Key register
        key: Register,
        /// Source register
        src: Register,
    },
    /// dst = obj.name
    GetPropConst {
        /// Destination register
        dst: Register,
        /// Object register
        obj: Register,
        /// Property name (string constant)
        name: ConstantIndex,
    },
    /// obj.name = src
    SetPropConst {
        /// Object register
        obj: Register,
        /// Property name (string constant)
        name: ConstantIndex,
        /// Source register
        src: Register,
    },
    /// arr.push(src) — array literal element append
    ArrayPush {
        /// Array register
        arr: Register,
        /// Source register
        src: Register,
    },

    // ==================== Functions ====================
    /// dst = closure over functions\[func\], capturing the current environment
    Closure {
        /// Destination register
        dst: Register,
        /// Function table index
        func: FunctionIndex,
    },
    /// dst = callee(args...); arguments in `args_start .. args_start+argc`
    Call {
        /// Destination register
        dst: Register,
        /// Callee register
        callee: Register,
        /// First argument register
        args_start: Register,
        /// Argument count
        argc: u8,
    },
    /// dst = obj.name(args...) — method call with `obj` as receiver
    CallMethod {
        /// Destination register
        dst: Register,
        /// Receiver register
        obj: Register,
        /// Method name (string constant)
        name: ConstantIndex,
        /// First argument register
        args_start: Register,
        /// Argument count
        argc: u8,
    },
    /// Return src from the current function
    Return {
        /// Source register
        src: Register,
    },
    /// Return undefined from the current function
    ReturnUndefined,

    // ==================== Control Flow ====================
    /// Unconditional relative jump
    Jump {
        /// Relative instruction offset
        offset: JumpOffset,
    },
    /// Jump when cond is truthy
    JumpIfTrue {
        /// Condition register
        cond: Register,
        /// Relative instruction offset
        offset: JumpOffset,
    },
    /// Jump when cond is falsy
    JumpIfFalse {
        /// Condition register
        cond: Register,
        /// Relative instruction offset
        offset: JumpOffset,
    },
    /// Jump when cond is null or undefined
    JumpIfNullish {
        /// Condition register
        cond: Register,
        /// Relative instruction offset
        offset: JumpOffset,
    },

    // ==================== Exception Handling ====================
    /// Push a catch handler at pc + offset for the current frame
    PushTry {
        /// Relative offset of the catch block
        catch_offset: JumpOffset,
    },
    /// Pop the innermost catch handler (end of try block)
    PopTry,
    /// Throw src as an exception
    Throw {
        /// Source register
        src: Register,
    },
    /// dst = the exception caught by the innermost handler
    LoadException {
        /// Destination register
        dst: Register,
    },

    // ==================== Generators / Async ====================
    /// Suspend the activation until src (a promise) settles; dst receives
    /// the fulfillment value on resume. Only valid inside async functions.
    Await {
        /// Destination register (filled on resume)
        dst: Register,
        /// Awaited value register
        src: Register,
    },
    /// Suspend the activation yielding src; dst receives the value passed
    /// to the next resume. Only valid inside generator functions.
    Yield {
        /// Destination register (filled on resume)
        dst: Register,
        /// Yielded value register
        src: Register,
    },
    /// dst = gen.next(arg) — an iterator result object { value, done }
    GeneratorNext {
        /// Destination register
        dst: Register,
        /// Generator register
        r#gen: Register,
        /// Resume argument register
        arg: Register,
    },
    /// dst = gen.return(arg)
    GeneratorReturn {
        /// Destination register
        dst: Register,
        /// Generator register
        r#gen: Register,
        /// Return value register
        arg: Register,
    },
    /// dst = gen.throw(arg)
    GeneratorThrow {
        /// Destination register
        dst: Register,
        /// Generator register
        r#gen: Register,
        /// Thrown value register
        arg: Register,
    },

    // ==================== Misc ====================
    /// No operation
    Nop,
}

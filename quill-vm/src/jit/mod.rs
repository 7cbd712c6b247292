// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Profile-guided native-code compilation for hot functions.
//!
//! When a function's call counter crosses the configured threshold the
//! VM asks [`compile`] for a native version; [`enter`] runs it through a
//! safe trampoline. The contract is strict: native code maintains the
//! real VM value stack op-for-op, so a failed type guard can exit
//! through the deopt side table and the interpreter resumes at exactly
//! the remaining instructions. Deoptimisation is not an error path; the
//! interpreter is the always-correct fallback.
//!
//! Compilation walks the bytecode once, tracking an approximate type per
//! stack slot. Arithmetic whose operands are statically known numbers
//! becomes inline SSE; everything else calls back into interpreter
//! runtime helpers. Property access goes through a monomorphic inline
//! cache keyed on (table, generation, bucket, slot). Functions that
//! build closures or touch coroutines never compile — the trampoline
//! must not sit between a coroutine swap and its frames.
//!
//! Only x86-64 SysV targets emit code; everywhere else `compile` returns
//! `None` and execution stays interpreted.

#[cfg(all(unix, target_arch = "x86_64"))]
mod assembler;
#[cfg(all(unix, target_arch = "x86_64"))]
mod memory;

use std::cell::Cell;
use std::rc::Rc;

use crate::chunk::FunctionProto;
use crate::heap::Handle;
use crate::vm::{Result, RuntimeError, Vm};

/// How a native activation left the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JitExit {
    /// The function returned; its result is on the VM stack.
    Returned,
    /// A guard failed: resume interpreting at this bytecode offset. The
    /// value stack is exactly as the interpreter would have left it.
    Deopt(usize),
}

/// One recorded mapping from generated code back to bytecode. Every
/// guard exit and helper call site gets an entry, so the runtime can
/// always answer "which instruction was that?".
#[derive(Debug, Clone, Copy)]
pub struct DeoptPoint {
    pub native_offset: u32,
    pub bytecode_offset: u32,
}

/// A monomorphic inline cache for one property-access site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IcEntry {
    pub table: Handle,
    pub generation: u32,
    pub bucket: u32,
    pub slot: u32,
}

#[derive(Debug, Default)]
pub struct InlineCache {
    pub(crate) entry: Cell<Option<IcEntry>>,
}

// =============================================================================
// Supported target: x86-64 SysV
// =============================================================================

#[cfg(all(unix, target_arch = "x86_64"))]
pub use x64::NativeCode;
#[cfg(all(unix, target_arch = "x86_64"))]
pub(crate) use x64::{compile, enter};

#[cfg(all(unix, target_arch = "x86_64"))]
mod x64 {
    use super::*;
    use crate::chunk::Constant;
    use crate::opcode::OpCode;
    use crate::table::Table;
    use crate::value::{
        Value, BOOL_PAYLOAD_OFFSET, TAG_BOOL, TAG_NIL, TAG_NUMBER, VALUE_SIZE,
    };
    use crate::vm::Dispatched;

    use super::assembler::{cc, sse, Asm};
    use super::memory::ExecBuffer;

    const OUTCOME_RETURN: u64 = 0;
    const OUTCOME_DEOPT: u64 = 1;
    const OUTCOME_ERROR: u64 = 2;

    /// Compiled native code for one function prototype.
    #[derive(Debug)]
    pub struct NativeCode {
        code: ExecBuffer,
        pub(crate) ics: Vec<InlineCache>,
        /// Side table mapping native exit points and helper sites back
        /// to bytecode offsets.
        pub deopts: Vec<DeoptPoint>,
        /// Deepest stack this function can reach, for the entry
        /// capacity check.
        max_height: usize,
    }

    /// The context block shared between the trampoline, generated code
    /// and the runtime helpers. Field offsets are baked into the
    /// assembler's prologue.
    #[repr(C)]
    pub(crate) struct JitContext {
        vm: *mut Vm,                      // 0x00
        stack_base: *mut Value,           // 0x08
        sp_bytes: u64,                    // 0x10
        frame_base_bytes: u64,            // 0x18
        ics: *const InlineCache,          // 0x20
        proto: *const FunctionProto,      // 0x28
    }

    type Entry = unsafe extern "C" fn(*mut JitContext) -> u64;
    type Helper = unsafe extern "C" fn(*mut JitContext, u32) -> u32;
    type F64Helper = extern "C" fn(f64, f64) -> f64;

    // =========================================================================
    // Trampoline
    // =========================================================================

    /// Run a compiled function over the current call window.
    /// `base` is the stack index of the function slot.
    pub(crate) fn enter(
        vm: &mut Vm,
        native: &NativeCode,
        proto: &Rc<FunctionProto>,
        base: usize,
    ) -> Result<JitExit> {
        if base + native.max_height > vm.state.stack.limit() {
            // Not enough headroom for the inline pushes; let the
            // interpreter run it and raise a proper overflow if needed.
            return Ok(JitExit::Deopt(0));
        }

        vm.jit_frames += 1;
        let len = vm.state.stack.len();
        let stack_base = vm.state.stack.base_ptr();
        let mut ctx = JitContext {
            vm: vm as *mut Vm,
            stack_base,
            sp_bytes: (len * VALUE_SIZE) as u64,
            frame_base_bytes: (base * VALUE_SIZE) as u64,
            ics: native.ics.as_ptr(),
            proto: Rc::as_ptr(proto),
        };
        // SAFETY: the buffer holds code generated for exactly this
        // context layout, and every slot below sp is an initialised
        // Value at each helper call and at exit.
        let outcome = unsafe {
            let entry: Entry = std::mem::transmute(native.code.as_ptr());
            entry(&mut ctx)
        };
        vm.jit_frames -= 1;

        // SAFETY: generated code only moves trivially-droppable values
        // bitwise; helpers maintained the length invariant themselves.
        unsafe {
            vm.state
                .stack
                .set_len_raw((ctx.sp_bytes as usize) / VALUE_SIZE);
        }

        match outcome & 0xFFFF_FFFF {
            OUTCOME_RETURN => Ok(JitExit::Returned),
            OUTCOME_DEOPT => Ok(JitExit::Deopt((outcome >> 32) as usize)),
            _ => Err(vm
                .jit_error
                .take()
                .unwrap_or_else(|| RuntimeError::Internal("jit error without detail".into()))),
        }
    }

    // =========================================================================
    // Abstract types
    // =========================================================================

    /// Approximate type of a stack slot during compilation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ty {
        /// Statically a number.
        Num,
        /// Statically a boolean.
        Bool,
        /// Unknown kind, but never carries a destructor (nil, booleans,
        /// numbers, heap handles, natives). Safe to move bitwise.
        NonDrop,
        /// Anything, including strings. Only helpers may touch it.
        Any,
    }

    fn merge(a: Ty, b: Ty) -> Ty {
        if a == b {
            a
        } else if a != Ty::Any && b != Ty::Any {
            Ty::NonDrop
        } else {
            Ty::Any
        }
    }

    fn is_copyable(t: Ty) -> bool {
        t != Ty::Any
    }

    struct Flow {
        /// Per-offset entry state; `None` for unreachable code.
        states: Vec<Option<Vec<Ty>>>,
        max_height: usize,
    }

    /// Dataflow pass: per-offset stack-slot types, iterated to fixpoint
    /// over joins. Returns `None` when the function uses an opcode the
    /// JIT does not model.
    fn analyse(proto: &FunctionProto) -> Option<Flow> {
        let code = &proto.chunk.code;
        if code.is_empty() {
            return None;
        }

        let mut states: Vec<Option<Vec<Ty>>> = vec![None; code.len()];
        let mut entry = Vec::with_capacity(1 + proto.arity as usize);
        entry.push(Ty::NonDrop); // slot 0: the function itself
        entry.extend(std::iter::repeat(Ty::Num).take(proto.arity as usize));

        let mut max_height = entry.len();
        states[0] = Some(entry);
        let mut work = vec![0usize];

        while let Some(off) = work.pop() {
            let mut st = states[off].clone()?;
            let op = *code.get(off)?;

            // (successor, state) pairs; Return has none.
            let mut succs: Vec<(usize, Vec<Ty>)> = Vec::with_capacity(2);
            let mut fallthrough = |st: Vec<Ty>, succs: &mut Vec<(usize, Vec<Ty>)>| {
                succs.push((off + 1, st));
            };

            let target = |o: i16| -> Option<usize> {
                let t = off as i64 + 1 + o as i64;
                if t < 0 || t as usize >= code.len() {
                    None
                } else {
                    Some(t as usize)
                }
            };

            match op {
                OpCode::Const(idx) => {
                    let ty = match proto.chunk.constants.get(idx as usize)? {
                        Constant::Nil => Ty::NonDrop,
                        Constant::Bool(_) => Ty::Bool,
                        Constant::Number(_) => Ty::Num,
                        Constant::Str(_) => Ty::Any,
                        Constant::Proto(_) => return None,
                    };
                    st.push(ty);
                    fallthrough(st, &mut succs);
                }
                OpCode::Nil => {
                    st.push(Ty::NonDrop);
                    fallthrough(st, &mut succs);
                }
                OpCode::True | OpCode::False => {
                    st.push(Ty::Bool);
                    fallthrough(st, &mut succs);
                }
                OpCode::Pop => {
                    st.pop()?;
                    fallthrough(st, &mut succs);
                }
                OpCode::Dup => {
                    let top = *st.last()?;
                    st.push(top);
                    fallthrough(st, &mut succs);
                }
                OpCode::GetLocal(i) => {
                    let ty = *st.get(i as usize)?;
                    st.push(ty);
                    fallthrough(st, &mut succs);
                }
                OpCode::SetLocal(i) => {
                    let top = *st.last()?;
                    *st.get_mut(i as usize)? = top;
                    fallthrough(st, &mut succs);
                }
                OpCode::GetGlobal(_) | OpCode::GetUpvalue(_) => {
                    st.push(Ty::Any);
                    fallthrough(st, &mut succs);
                }
                OpCode::SetGlobal(_) | OpCode::SetUpvalue(_) => {
                    st.last()?;
                    fallthrough(st, &mut succs);
                }
                OpCode::DefineGlobal(_) => {
                    st.pop()?;
                    fallthrough(st, &mut succs);
                }
                OpCode::NewTable(_) => {
                    st.push(Ty::NonDrop);
                    fallthrough(st, &mut succs);
                }
                OpCode::GetField => {
                    st.pop()?;
                    st.pop()?;
                    st.push(Ty::Any);
                    fallthrough(st, &mut succs);
                }
                OpCode::SetField => {
                    let value = st.pop()?;
                    st.pop()?;
                    st.pop()?;
                    st.push(value);
                    fallthrough(st, &mut succs);
                }
                OpCode::Add => {
                    let b = st.pop()?;
                    let a = st.pop()?;
                    st.push(if a == Ty::Num && b == Ty::Num {
                        Ty::Num
                    } else {
                        Ty::Any // may be a string concatenation
                    });
                    fallthrough(st, &mut succs);
                }
                OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                    st.pop()?;
                    st.pop()?;
                    st.push(Ty::Num);
                    fallthrough(st, &mut succs);
                }
                OpCode::Negate => {
                    st.pop()?;
                    st.push(Ty::Num);
                    fallthrough(st, &mut succs);
                }
                OpCode::Eq
                | OpCode::Ne
                | OpCode::Lt
                | OpCode::Le
                | OpCode::Gt
                | OpCode::Ge => {
                    st.pop()?;
                    st.pop()?;
                    st.push(Ty::Bool);
                    fallthrough(st, &mut succs);
                }
                OpCode::Not => {
                    st.pop()?;
                    st.push(Ty::Bool);
                    fallthrough(st, &mut succs);
                }
                OpCode::Jump(o) => {
                    succs.push((target(o)?, st));
                }
                OpCode::JumpIfFalse(o) | OpCode::JumpIfTrue(o) => {
                    st.last()?;
                    succs.push((target(o)?, st.clone()));
                    fallthrough(st, &mut succs);
                }
                OpCode::PopJumpIfFalse(o) => {
                    st.pop()?;
                    succs.push((target(o)?, st.clone()));
                    fallthrough(st, &mut succs);
                }
                OpCode::Call(argc) => {
                    for _ in 0..=(argc as usize) {
                        st.pop()?;
                    }
                    st.push(Ty::Any);
                    fallthrough(st, &mut succs);
                }
                OpCode::Return => {
                    st.pop()?;
                }

                // Closure construction and coroutine suspension never
                // compile.
                OpCode::Closure(_)
                | OpCode::CaptureLocal(_)
                | OpCode::CaptureUpvalue(_)
                | OpCode::CloseUpvalue
                | OpCode::Yield
                | OpCode::Resume => return None,
            }

            for (succ, new_state) in succs {
                if succ >= states.len() {
                    return None;
                }
                max_height = max_height.max(new_state.len());
                match &mut states[succ] {
                    slot @ None => {
                        *slot = Some(new_state);
                        work.push(succ);
                    }
                    Some(old) => {
                        if old.len() != new_state.len() {
                            return None;
                        }
                        let merged: Vec<Ty> = old
                            .iter()
                            .zip(new_state.iter())
                            .map(|(&a, &b)| merge(a, b))
                            .collect();
                        if merged != *old {
                            *old = merged;
                            work.push(succ);
                        }
                    }
                }
            }
        }

        Some(Flow { states, max_height })
    }

    // =========================================================================
    // Code generation
    // =========================================================================

    /// Argument index passed to `jit_binary`/`jit_compare`, mirroring
    /// the opcode it stands in for.
    fn binary_code(op: OpCode) -> u32 {
        match op {
            OpCode::Add => 0,
            OpCode::Sub => 1,
            OpCode::Mul => 2,
            OpCode::Div => 3,
            OpCode::Mod => 4,
            OpCode::Pow => 5,
            _ => unreachable!(),
        }
    }

    fn compare_code(op: OpCode) -> u32 {
        match op {
            OpCode::Lt => 0,
            OpCode::Le => 1,
            OpCode::Gt => 2,
            OpCode::Ge => 3,
            _ => unreachable!(),
        }
    }

    /// One-shot compilation of a prototype. `None` means "stay
    /// interpreted" — unsupported opcode, malformed flow, or a target
    /// the JIT does not handle.
    pub(crate) fn compile(proto: &FunctionProto) -> Option<NativeCode> {
        let flow = analyse(proto)?;
        let code = &proto.chunk.code;

        let mut asm = Asm::new();
        let mut native_offsets = vec![0usize; code.len() + 1];
        // (patch position, target bytecode offset)
        let mut fixups: Vec<(usize, usize)> = Vec::new();
        // (patch position, deopt bytecode offset)
        let mut deopt_jumps: Vec<(usize, usize)> = Vec::new();
        let mut err_jumps: Vec<usize> = Vec::new();
        let mut div_zero_jumps: Vec<usize> = Vec::new();
        let mut exit_jumps: Vec<usize> = Vec::new();
        let mut deopts: Vec<DeoptPoint> = Vec::new();
        let mut ic_count: u32 = 0;

        let slot = VALUE_SIZE as i32;
        let pay = 8;
        let boolpay = BOOL_PAYLOAD_OFFSET as i32;

        asm.prologue();

        // Entry guard: deoptimise immediately unless every argument is
        // a number. After this, parameter slots are statically Num.
        for i in 1..=(proto.arity as usize) {
            asm.cmp_byte_local((i as i32) * slot, TAG_NUMBER);
            deopt_jumps.push((asm.jcc(cc::NE), 0));
        }

        let call_helper = |asm: &mut Asm,
                               deopts: &mut Vec<DeoptPoint>,
                               err_jumps: &mut Vec<usize>,
                               helper: Helper,
                               operand: u32,
                               off: usize| {
            deopts.push(DeoptPoint {
                native_offset: asm.pos() as u32,
                bytecode_offset: off as u32,
            });
            asm.call_helper(helper as usize, operand);
            asm.test_eax_eax();
            err_jumps.push(asm.jcc(cc::NE));
        };

        for off in 0..code.len() {
            native_offsets[off] = asm.pos();
            let Some(state) = &flow.states[off] else {
                continue; // unreachable instruction
            };
            let st = state.as_slice();
            let height = st.len();
            let ty_top = |n: usize| st[height - 1 - n];

            match code[off] {
                OpCode::Const(idx) => match &proto.chunk.constants[idx as usize] {
                    Constant::Number(n) => {
                        asm.write_tag_sp(0, TAG_NUMBER);
                        asm.mov_rax_imm64(n.to_bits());
                        asm.store_rax_sp(pay);
                        asm.add_sp(slot as i8);
                    }
                    Constant::Bool(b) => {
                        asm.write_tag_sp(0, TAG_BOOL);
                        if *b {
                            asm.write_byte_sp(boolpay, 1);
                        }
                        asm.add_sp(slot as i8);
                    }
                    Constant::Nil => {
                        asm.write_tag_sp(0, TAG_NIL);
                        asm.add_sp(slot as i8);
                    }
                    Constant::Str(_) => {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_push_const,
                            idx as u32,
                            off,
                        );
                    }
                    Constant::Proto(_) => return None,
                },
                OpCode::Nil => {
                    asm.write_tag_sp(0, TAG_NIL);
                    asm.add_sp(slot as i8);
                }
                OpCode::True => {
                    asm.write_tag_sp(0, TAG_BOOL);
                    asm.write_byte_sp(boolpay, 1);
                    asm.add_sp(slot as i8);
                }
                OpCode::False => {
                    asm.write_tag_sp(0, TAG_BOOL);
                    asm.add_sp(slot as i8);
                }
                OpCode::Pop => {
                    if is_copyable(ty_top(0)) {
                        asm.sub_sp(slot as i8);
                    } else {
                        call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_pop, 0, off);
                    }
                }
                OpCode::Dup => {
                    if is_copyable(ty_top(0)) {
                        asm.load_rax_sp(-slot);
                        asm.store_rax_sp(0);
                        asm.load_rax_sp(-slot + pay);
                        asm.store_rax_sp(pay);
                        asm.add_sp(slot as i8);
                    } else {
                        call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_dup, 0, off);
                    }
                }
                OpCode::GetLocal(i) => {
                    if is_copyable(st[i as usize]) {
                        let local = (i as i32) * slot;
                        asm.load_rax_local(local);
                        asm.store_rax_sp(0);
                        asm.load_rax_local(local + pay);
                        asm.store_rax_sp(pay);
                        asm.add_sp(slot as i8);
                    } else {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_get_local,
                            i as u32,
                            off,
                        );
                    }
                }
                OpCode::SetLocal(i) => {
                    if is_copyable(st[i as usize]) && is_copyable(ty_top(0)) {
                        let local = (i as i32) * slot;
                        asm.load_rax_sp(-slot);
                        asm.store_rax_local(local);
                        asm.load_rax_sp(-slot + pay);
                        asm.store_rax_local(local + pay);
                    } else {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_set_local,
                            i as u32,
                            off,
                        );
                    }
                }

                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow) => {
                    if ty_top(0) == Ty::Num && ty_top(1) == Ty::Num {
                        asm.movsd_load(0, -2 * slot + pay); // a
                        asm.movsd_load(1, -slot + pay); // b
                        match op {
                            OpCode::Add => asm.sse_op_xmm0_xmm1(sse::ADD),
                            OpCode::Sub => asm.sse_op_xmm0_xmm1(sse::SUB),
                            OpCode::Mul => asm.sse_op_xmm0_xmm1(sse::MUL),
                            OpCode::Div => {
                                // Inline divide-by-zero check; NaN
                                // divisors set parity and skip it.
                                asm.zero_xmm2();
                                asm.ucomisd_xmm1_xmm2();
                                let not_nan = asm.jcc(cc::P);
                                let not_zero = asm.jcc(cc::NE);
                                div_zero_jumps.push(asm.jmp());
                                asm.patch_to_here(not_nan);
                                asm.patch_to_here(not_zero);
                                asm.sse_op_xmm0_xmm1(sse::DIV);
                            }
                            OpCode::Mod => asm.call_f64_helper(jit_fmod as F64Helper as usize),
                            OpCode::Pow => asm.call_f64_helper(jit_pow as F64Helper as usize),
                            _ => unreachable!(),
                        }
                        asm.movsd_store_xmm0(-2 * slot + pay);
                        asm.sub_sp(slot as i8);
                    } else {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_binary,
                            binary_code(op),
                            off,
                        );
                    }
                }

                OpCode::Negate => {
                    if ty_top(0) == Ty::Num {
                        asm.movsd_load(0, -slot + pay);
                        asm.mov_rax_imm64(0x8000_0000_0000_0000);
                        asm.movq_xmm_rax(1);
                        asm.xorpd_xmm0_xmm1();
                        asm.movsd_store_xmm0(-slot + pay);
                    } else {
                        call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_negate, 0, off);
                    }
                }

                op @ (OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge) => {
                    if ty_top(0) == Ty::Num && ty_top(1) == Ty::Num {
                        asm.movsd_load(0, -2 * slot + pay); // a
                        asm.movsd_load(1, -slot + pay); // b
                        match op {
                            // a < b  <=>  b above a; unordered fails.
                            OpCode::Lt => {
                                asm.ucomisd(1, 0);
                                asm.setcc_al(cc::A);
                            }
                            OpCode::Le => {
                                asm.ucomisd(1, 0);
                                asm.setcc_al(cc::AE);
                            }
                            OpCode::Gt => {
                                asm.ucomisd(0, 1);
                                asm.setcc_al(cc::A);
                            }
                            OpCode::Ge => {
                                asm.ucomisd(0, 1);
                                asm.setcc_al(cc::AE);
                            }
                            _ => unreachable!(),
                        }
                        asm.write_tag_sp(-2 * slot, TAG_BOOL);
                        asm.store_al_sp(-2 * slot + boolpay);
                        asm.sub_sp(slot as i8);
                    } else {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_compare,
                            compare_code(op),
                            off,
                        );
                    }
                }

                op @ (OpCode::Eq | OpCode::Ne) => {
                    if ty_top(0) == Ty::Num && ty_top(1) == Ty::Num {
                        asm.movsd_load(0, -2 * slot + pay);
                        asm.movsd_load(1, -slot + pay);
                        asm.ucomisd(0, 1);
                        if op == OpCode::Eq {
                            asm.setcc_al(cc::E);
                            asm.setcc_cl(cc::NP);
                            asm.and_al_cl();
                        } else {
                            asm.setcc_al(cc::NE);
                            asm.setcc_cl(cc::P);
                            asm.or_al_cl();
                        }
                        asm.write_tag_sp(-2 * slot, TAG_BOOL);
                        asm.store_al_sp(-2 * slot + boolpay);
                        asm.sub_sp(slot as i8);
                    } else {
                        call_helper(
                            &mut asm,
                            &mut deopts,
                            &mut err_jumps,
                            jit_equal,
                            (op == OpCode::Ne) as u32,
                            off,
                        );
                    }
                }

                OpCode::Not => match ty_top(0) {
                    Ty::Bool => asm.xor_byte_sp(-slot + boolpay, 1),
                    Ty::Num => {
                        // Numbers are always truthy.
                        asm.write_tag_sp(-slot, TAG_BOOL);
                    }
                    _ => {
                        call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_not, 0, off);
                    }
                },

                OpCode::Jump(o) => {
                    let target = (off as i64 + 1 + o as i64) as usize;
                    fixups.push((asm.jmp(), target));
                }
                OpCode::JumpIfFalse(o) => {
                    let target = (off as i64 + 1 + o as i64) as usize;
                    match ty_top(0) {
                        Ty::Bool => {
                            asm.cmp_byte_sp(-slot + boolpay, 0);
                            fixups.push((asm.jcc(cc::E), target));
                        }
                        Ty::Num => {} // numbers are truthy; no branch
                        _ => {
                            emit_truthy_branch(
                                &mut asm,
                                &mut deopts,
                                &mut err_jumps,
                                &mut fixups,
                                jit_truthy,
                                off,
                                target,
                                cc::E,
                            );
                        }
                    }
                }
                OpCode::JumpIfTrue(o) => {
                    let target = (off as i64 + 1 + o as i64) as usize;
                    match ty_top(0) {
                        Ty::Bool => {
                            asm.cmp_byte_sp(-slot + boolpay, 0);
                            fixups.push((asm.jcc(cc::NE), target));
                        }
                        Ty::Num => {
                            fixups.push((asm.jmp(), target));
                        }
                        _ => {
                            emit_truthy_branch(
                                &mut asm,
                                &mut deopts,
                                &mut err_jumps,
                                &mut fixups,
                                jit_truthy,
                                off,
                                target,
                                cc::NE,
                            );
                        }
                    }
                }
                OpCode::PopJumpIfFalse(o) => {
                    let target = (off as i64 + 1 + o as i64) as usize;
                    match ty_top(0) {
                        Ty::Bool => {
                            asm.cmp_byte_sp(-slot + boolpay, 0);
                            asm.sub_sp(slot as i8);
                            fixups.push((asm.jcc(cc::E), target));
                        }
                        Ty::Num => {
                            asm.sub_sp(slot as i8);
                        }
                        _ => {
                            emit_truthy_branch(
                                &mut asm,
                                &mut deopts,
                                &mut err_jumps,
                                &mut fixups,
                                jit_truthy_pop,
                                off,
                                target,
                                cc::E,
                            );
                        }
                    }
                }

                OpCode::GetGlobal(idx) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_get_global,
                    idx as u32,
                    off,
                ),
                OpCode::SetGlobal(idx) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_set_global,
                    idx as u32,
                    off,
                ),
                OpCode::DefineGlobal(idx) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_define_global,
                    idx as u32,
                    off,
                ),
                OpCode::GetUpvalue(idx) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_get_upvalue,
                    idx as u32,
                    off,
                ),
                OpCode::SetUpvalue(idx) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_set_upvalue,
                    idx as u32,
                    off,
                ),
                OpCode::NewTable(n) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_new_table,
                    n as u32,
                    off,
                ),
                OpCode::GetField => {
                    let ic = ic_count;
                    ic_count += 1;
                    call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_get_field, ic, off);
                }
                OpCode::SetField => {
                    call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_set_field, 0, off)
                }
                OpCode::Call(argc) => call_helper(
                    &mut asm,
                    &mut deopts,
                    &mut err_jumps,
                    jit_call,
                    argc as u32,
                    off,
                ),

                OpCode::Return => {
                    if st.iter().all(|&t| is_copyable(t)) {
                        // Move the result into the frame base slot and
                        // reset the stack top. Everything in between is
                        // trivially droppable.
                        asm.load_rax_sp(-slot);
                        asm.store_rax_local(0);
                        asm.load_rax_sp(-slot + pay);
                        asm.store_rax_local(pay);
                        asm.set_sp_to_frame_base_plus(slot as i8);
                    } else {
                        call_helper(&mut asm, &mut deopts, &mut err_jumps, jit_return, 0, off);
                    }
                    asm.mov_rax_imm64(OUTCOME_RETURN);
                    exit_jumps.push(asm.jmp());
                }

                OpCode::Closure(_)
                | OpCode::CaptureLocal(_)
                | OpCode::CaptureUpvalue(_)
                | OpCode::CloseUpvalue
                | OpCode::Yield
                | OpCode::Resume => return None,
            }
        }
        native_offsets[code.len()] = asm.pos();

        // Deopt stubs: one per distinct bytecode offset.
        let mut stub_at: Vec<(usize, usize)> = Vec::new();
        for (patch, bc) in deopt_jumps {
            let pos = match stub_at.iter().find(|(b, _)| *b == bc) {
                Some((_, pos)) => *pos,
                None => {
                    let pos = asm.pos();
                    deopts.push(DeoptPoint {
                        native_offset: pos as u32,
                        bytecode_offset: bc as u32,
                    });
                    asm.mov_rax_imm64(OUTCOME_DEOPT | ((bc as u64) << 32));
                    exit_jumps.push(asm.jmp());
                    stub_at.push((bc, pos));
                    pos
                }
            };
            asm.patch_rel32(patch, pos);
        }

        // Division-by-zero raises through a helper so the error carries
        // detail, then exits through the error path.
        if !div_zero_jumps.is_empty() {
            let pos = asm.pos();
            for patch in div_zero_jumps {
                asm.patch_rel32(patch, pos);
            }
            asm.call_helper(jit_div_zero as Helper as usize, 0);
            err_jumps.push(asm.jmp());
        }

        // Error exit: helpers stored the detail on the VM.
        let error_pos = asm.pos();
        for patch in err_jumps {
            asm.patch_rel32(patch, error_pos);
        }
        asm.mov_rax_imm64(OUTCOME_ERROR);

        // Common exit.
        let exit_pos = asm.pos();
        for patch in exit_jumps {
            asm.patch_rel32(patch, exit_pos);
        }
        asm.epilogue();

        // Branch targets.
        for (patch, target_bc) in fixups {
            asm.patch_rel32(patch, native_offsets[target_bc]);
        }

        let code_bytes = asm.into_code();
        let buffer = ExecBuffer::new(&code_bytes)?;
        let ics = (0..ic_count).map(|_| InlineCache::default()).collect();

        Some(NativeCode {
            code: buffer,
            ics,
            deopts,
            max_height: flow.max_height,
        })
    }

    /// Branch on the truthiness of the top value via a helper that
    /// returns 0 (falsy), 1 (truthy) or 2 (error).
    #[allow(clippy::too_many_arguments)]
    fn emit_truthy_branch(
        asm: &mut Asm,
        deopts: &mut Vec<DeoptPoint>,
        err_jumps: &mut Vec<usize>,
        fixups: &mut Vec<(usize, usize)>,
        helper: Helper,
        off: usize,
        target: usize,
        jump_when: u8,
    ) {
        deopts.push(DeoptPoint {
            native_offset: asm.pos() as u32,
            bytecode_offset: off as u32,
        });
        asm.call_helper(helper as usize, 0);
        asm.cmp_eax_imm8(2);
        err_jumps.push(asm.jcc(cc::E));
        asm.test_eax_eax();
        fixups.push((asm.jcc(jump_when), target));
    }

    // =========================================================================
    // Runtime helpers (called from generated code)
    // =========================================================================

    /// Rebind the context and sync the VM stack length in.
    ///
    /// # Safety
    ///
    /// `ctx` must be the live context of the current native activation.
    unsafe fn sync_in<'a>(ctx: *mut JitContext) -> (&'a mut Vm, &'a mut JitContext) {
        let ctx = &mut *ctx;
        let vm = &mut *ctx.vm;
        vm.state
            .stack
            .set_len_raw((ctx.sp_bytes as usize) / VALUE_SIZE);
        (vm, ctx)
    }

    fn sync_out(vm: &mut Vm, ctx: &mut JitContext, result: Result<()>) -> u32 {
        ctx.sp_bytes = (vm.state.stack.len() * VALUE_SIZE) as u64;
        match result {
            Ok(()) => 0,
            Err(err) => {
                vm.jit_error = Some(err);
                1
            }
        }
    }

    unsafe extern "C" fn jit_push_const(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let value = match (&(*ctx.proto).chunk.constants).get(idx as usize) {
            Some(Constant::Nil) => Value::Nil,
            Some(Constant::Bool(b)) => Value::Bool(*b),
            Some(Constant::Number(n)) => Value::Number(*n),
            Some(Constant::Str(s)) => Value::Str(s.clone()),
            _ => {
                let r = Err(RuntimeError::Internal("bad jit constant".into()));
                return sync_out(vm, ctx, r);
            }
        };
        let r = vm.state.stack.push(value);
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_pop(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = vm.state.stack.pop().map(|_| ());
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_dup(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = vm
            .state
            .stack
            .peek(0)
            .and_then(|v| vm.state.stack.push(v));
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_get_local(ctx: *mut JitContext, slot: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let base = (ctx.frame_base_bytes as usize) / VALUE_SIZE;
        let r = vm
            .state
            .stack
            .get(base + slot as usize)
            .and_then(|v| vm.state.stack.push(v));
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_set_local(ctx: *mut JitContext, slot: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let base = (ctx.frame_base_bytes as usize) / VALUE_SIZE;
        let r = vm
            .state
            .stack
            .peek(0)
            .and_then(|v| vm.state.stack.set(base + slot as usize, v));
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_binary(ctx: *mut JitContext, op: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let op = match op {
            0 => OpCode::Add,
            1 => OpCode::Sub,
            2 => OpCode::Mul,
            3 => OpCode::Div,
            4 => OpCode::Mod,
            _ => OpCode::Pow,
        };
        let r = vm.execute_arithmetic(op);
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_negate(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = vm.execute_arithmetic(OpCode::Negate);
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_compare(ctx: *mut JitContext, op: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let op = match op {
            0 => OpCode::Lt,
            1 => OpCode::Le,
            2 => OpCode::Gt,
            _ => OpCode::Ge,
        };
        let r = vm.execute_arithmetic(op);
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_equal(ctx: *mut JitContext, negate: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let b = vm.state.stack.pop()?;
            let a = vm.state.stack.pop()?;
            let eq = a == b;
            vm.state.stack.push(Value::Bool(eq != (negate != 0)))
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_not(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let v = vm.state.stack.pop()?;
            vm.state.stack.push(Value::Bool(!v.is_truthy()))
        })();
        sync_out(vm, ctx, r)
    }

    /// Returns 0 = falsy, 1 = truthy, 2 = error. Peeks.
    unsafe extern "C" fn jit_truthy(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        match vm.state.stack.peek(0) {
            Ok(v) => {
                let t = v.is_truthy() as u32;
                sync_out(vm, ctx, Ok(()));
                t
            }
            Err(err) => {
                sync_out(vm, ctx, Err(err));
                2
            }
        }
    }

    /// Returns 0 = falsy, 1 = truthy, 2 = error. Pops.
    unsafe extern "C" fn jit_truthy_pop(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        match vm.state.stack.pop() {
            Ok(v) => {
                let t = v.is_truthy() as u32;
                sync_out(vm, ctx, Ok(()));
                t
            }
            Err(err) => {
                sync_out(vm, ctx, Err(err));
                2
            }
        }
    }

    unsafe extern "C" fn jit_get_global(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let name = match (&(*ctx.proto).chunk.constants).get(idx as usize) {
                Some(Constant::Str(s)) => s.clone(),
                _ => return Err(RuntimeError::Internal("bad global name constant".into())),
            };
            let value = vm
                .heap
                .get_table(vm.globals_handle())
                .and_then(|t| t.get(&name).cloned())
                .unwrap_or(Value::Nil);
            vm.state.stack.push(value)
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_set_global(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let name = match (&(*ctx.proto).chunk.constants).get(idx as usize) {
                Some(Constant::Str(s)) => s.clone(),
                _ => return Err(RuntimeError::Internal("bad global name constant".into())),
            };
            let value = vm.state.stack.peek(0)?;
            let globals = vm.globals_handle();
            vm.heap
                .get_table_mut(globals)
                .ok_or_else(|| RuntimeError::Internal("globals table missing".into()))?
                .insert(name, value);
            Ok(())
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_define_global(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let name = match (&(*ctx.proto).chunk.constants).get(idx as usize) {
                Some(Constant::Str(s)) => s.clone(),
                _ => return Err(RuntimeError::Internal("bad global name constant".into())),
            };
            let value = vm.state.stack.pop()?;
            let globals = vm.globals_handle();
            vm.heap
                .get_table_mut(globals)
                .ok_or_else(|| RuntimeError::Internal("globals table missing".into()))?
                .insert(name, value);
            Ok(())
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_get_upvalue(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let base = (ctx.frame_base_bytes as usize) / VALUE_SIZE;
        let r = (|| {
            let closure = match vm.state.stack.get(base)? {
                Value::Function(h) => h,
                _ => return Err(RuntimeError::Internal("frame base is not a closure".into())),
            };
            let handle = vm
                .heap
                .get_function(closure)
                .and_then(|f| f.upvalues.get(idx as usize).copied())
                .ok_or_else(|| RuntimeError::Internal("upvalue index out of bounds".into()))?;
            let value = match &vm
                .heap
                .get_upvalue(handle)
                .ok_or_else(|| RuntimeError::Internal("stale upvalue handle".into()))?
                .state
            {
                crate::heap::UpvalueState::Open(slot) => vm.state.stack.get(*slot)?,
                crate::heap::UpvalueState::Closed(v) => v.clone(),
            };
            vm.state.stack.push(value)
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_set_upvalue(ctx: *mut JitContext, idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let base = (ctx.frame_base_bytes as usize) / VALUE_SIZE;
        let r = (|| {
            let closure = match vm.state.stack.get(base)? {
                Value::Function(h) => h,
                _ => return Err(RuntimeError::Internal("frame base is not a closure".into())),
            };
            let handle = vm
                .heap
                .get_function(closure)
                .and_then(|f| f.upvalues.get(idx as usize).copied())
                .ok_or_else(|| RuntimeError::Internal("upvalue index out of bounds".into()))?;
            let value = vm.state.stack.peek(0)?;
            let upvalue = vm
                .heap
                .get_upvalue_mut(handle)
                .ok_or_else(|| RuntimeError::Internal("stale upvalue handle".into()))?;
            match &mut upvalue.state {
                crate::heap::UpvalueState::Open(slot) => {
                    let slot = *slot;
                    vm.state.stack.set(slot, value)?;
                }
                crate::heap::UpvalueState::Closed(stored) => *stored = value,
            }
            Ok(())
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_new_table(ctx: *mut JitContext, capacity: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let handle = vm.heap.alloc_table(Table::with_capacity(capacity as usize));
        let r = vm.state.stack.push(Value::Table(handle));
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_get_field(ctx: *mut JitContext, ic_idx: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let ic = &*ctx.ics.add(ic_idx as usize);
        let r = (|| {
            let key = vm.state.stack.pop()?;
            let object = vm.state.stack.pop()?;

            if let (Value::Table(table), Value::Str(k)) = (&object, &key) {
                // Inline-cache hit: same table, unchanged shape, key
                // still at the recorded position.
                if let Some(entry) = ic.entry.get() {
                    if entry.table == *table {
                        if let Some(t) = vm.heap.get_table(*table) {
                            if t.generation() == entry.generation {
                                if let Some(v) = t.get_at(entry.bucket, entry.slot, k) {
                                    let v = v.clone();
                                    return vm.state.stack.push(v);
                                }
                            }
                        }
                    }
                }
                let value = vm.field_get(&object, &key)?;
                if let Some(t) = vm.heap.get_table(*table) {
                    if let Some((bucket, slot)) = t.locate(k) {
                        ic.entry.set(Some(IcEntry {
                            table: *table,
                            generation: t.generation(),
                            bucket,
                            slot,
                        }));
                    }
                }
                return vm.state.stack.push(value);
            }

            // Not a table/string access: produce the interpreter's
            // error (or value) without caching.
            let value = vm.field_get(&object, &key)?;
            vm.state.stack.push(value)
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_set_field(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let value = vm.state.stack.pop()?;
            let key = vm.state.stack.pop()?;
            let object = vm.state.stack.pop()?;
            vm.field_set(&object, &key, value.clone())?;
            vm.state.stack.push(value)
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_call(ctx: *mut JitContext, argc: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let r = (|| {
            let watermark = vm.state.frames.len();
            let coro_depth = vm.active_coros.len();
            match vm.call_stack_top(argc as usize)? {
                Dispatched::Immediate => Ok(()),
                Dispatched::Frame => {
                    let value = vm.run_loop(watermark, coro_depth)?;
                    vm.state.stack.push(value)
                }
            }
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_return(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        let base = (ctx.frame_base_bytes as usize) / VALUE_SIZE;
        let r = (|| {
            let result = vm.state.stack.pop()?;
            vm.state.stack.truncate(base);
            vm.state.stack.push(result)
        })();
        sync_out(vm, ctx, r)
    }

    unsafe extern "C" fn jit_div_zero(ctx: *mut JitContext, _operand: u32) -> u32 {
        let (vm, ctx) = sync_in(ctx);
        sync_out(vm, ctx, Err(RuntimeError::DivisionByZero))
    }

    extern "C" fn jit_fmod(a: f64, b: f64) -> f64 {
        a % b
    }

    extern "C" fn jit_pow(a: f64, b: f64) -> f64 {
        a.powf(b)
    }
}

// =============================================================================
// Unsupported targets: everything stays interpreted
// =============================================================================

#[cfg(not(all(unix, target_arch = "x86_64")))]
mod fallback {
    use super::*;

    /// Placeholder; never constructed on this target.
    #[derive(Debug)]
    pub struct NativeCode {
        _private: (),
    }

    pub(crate) fn compile(_proto: &FunctionProto) -> Option<NativeCode> {
        None
    }

    pub(crate) fn enter(
        _vm: &mut Vm,
        _native: &NativeCode,
        _proto: &Rc<FunctionProto>,
        _base: usize,
    ) -> Result<JitExit> {
        Err(RuntimeError::Internal(
            "jit entry on an unsupported target".into(),
        ))
    }
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
pub use fallback::NativeCode;
#[cfg(not(all(unix, target_arch = "x86_64")))]
pub(crate) use fallback::{compile, enter};

// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! A small x86-64 assembler for the JIT.
//!
//! Register conventions in generated code:
//!
//! - `rbx`  — pointer to the `JitContext`
//! - `r12`  — value stack base pointer (stable; the stack never grows)
//! - `r13`  — stack top as a byte offset from `r12`
//! - `r14`  — absolute pointer to the frame's base slot
//!
//! Values are 16 bytes: tag byte at offset 0, number payload at offset
//! 8, boolean payload at offset 1 (`value.rs` pins this layout). Stack
//! operands are addressed `[r12 + r13 + disp]` with negative
//! displacements from the top; locals are `[r14 + slot * 16]`.

/// Condition codes for `setcc`/`jcc`.
pub(crate) mod cc {
    pub const B: u8 = 0x2; // below (carry)
    pub const AE: u8 = 0x3; // above or equal
    pub const E: u8 = 0x4; // equal
    pub const NE: u8 = 0x5; // not equal
    pub const A: u8 = 0x7; // above
    pub const P: u8 = 0xA; // parity (unordered)
    pub const NP: u8 = 0xB; // no parity
}

/// SSE scalar-double opcodes (the `F2 0F xx` family).
pub(crate) mod sse {
    pub const ADD: u8 = 0x58;
    pub const SUB: u8 = 0x5C;
    pub const MUL: u8 = 0x59;
    pub const DIV: u8 = 0x5E;
}

pub(crate) struct Asm {
    code: Vec<u8>,
}

impl Asm {
    pub fn new() -> Self {
        Asm { code: Vec::new() }
    }

    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn u8(&mut self, b: u8) {
        self.code.push(b);
    }

    fn i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    // =========================================================================
    // Prologue / epilogue
    // =========================================================================

    /// Save callee-saved registers and load the context registers.
    /// After five pushes the stack is 16-byte aligned for helper calls.
    pub fn prologue(&mut self) {
        self.bytes(&[0x55]); // push rbp
        self.bytes(&[0x53]); // push rbx
        self.bytes(&[0x41, 0x54]); // push r12
        self.bytes(&[0x41, 0x55]); // push r13
        self.bytes(&[0x41, 0x56]); // push r14
        self.bytes(&[0x48, 0x89, 0xFB]); // mov rbx, rdi
        self.bytes(&[0x4C, 0x8B, 0x63, 0x08]); // mov r12, [rbx + 0x08]
        self.bytes(&[0x4C, 0x8B, 0x6B, 0x10]); // mov r13, [rbx + 0x10]
        self.bytes(&[0x4C, 0x8B, 0x73, 0x18]); // mov r14, [rbx + 0x18]
        self.bytes(&[0x4D, 0x01, 0xE6]); // add r14, r12
    }

    /// Sync the stack top back into the context and return. `rax` holds
    /// the outcome word.
    pub fn epilogue(&mut self) {
        self.sync_sp_to_ctx();
        self.bytes(&[0x41, 0x5E]); // pop r14
        self.bytes(&[0x41, 0x5D]); // pop r13
        self.bytes(&[0x41, 0x5C]); // pop r12
        self.bytes(&[0x5B]); // pop rbx
        self.bytes(&[0x5D]); // pop rbp
        self.bytes(&[0xC3]); // ret
    }

    pub fn sync_sp_to_ctx(&mut self) {
        self.bytes(&[0x4C, 0x89, 0x6B, 0x10]); // mov [rbx + 0x10], r13
    }

    pub fn load_sp_from_ctx(&mut self) {
        self.bytes(&[0x4C, 0x8B, 0x6B, 0x10]); // mov r13, [rbx + 0x10]
    }

    // =========================================================================
    // Immediates & moves
    // =========================================================================

    pub fn mov_rax_imm64(&mut self, v: u64) {
        self.bytes(&[0x48, 0xB8]);
        self.u64(v);
    }

    /// mov [r12 + r13 + disp], rax
    pub fn store_rax_sp(&mut self, disp: i32) {
        self.bytes(&[0x4B, 0x89, 0x84, 0x2C]);
        self.i32(disp);
    }

    /// mov rax, [r12 + r13 + disp]
    pub fn load_rax_sp(&mut self, disp: i32) {
        self.bytes(&[0x4B, 0x8B, 0x84, 0x2C]);
        self.i32(disp);
    }

    /// mov qword [r12 + r13 + disp], imm32 — writes a tag byte and
    /// zeroes the padding in one store.
    pub fn write_tag_sp(&mut self, disp: i32, tag: u8) {
        self.bytes(&[0x4B, 0xC7, 0x84, 0x2C]);
        self.i32(disp);
        self.i32(tag as i32);
    }

    /// mov byte [r12 + r13 + disp], imm8
    pub fn write_byte_sp(&mut self, disp: i32, value: u8) {
        self.bytes(&[0x43, 0xC6, 0x84, 0x2C]);
        self.i32(disp);
        self.u8(value);
    }

    /// mov byte [r12 + r13 + disp], al
    pub fn store_al_sp(&mut self, disp: i32) {
        self.bytes(&[0x43, 0x88, 0x84, 0x2C]);
        self.i32(disp);
    }

    /// cmp byte [r12 + r13 + disp], imm8
    pub fn cmp_byte_sp(&mut self, disp: i32, value: u8) {
        self.bytes(&[0x43, 0x80, 0xBC, 0x2C]);
        self.i32(disp);
        self.u8(value);
    }

    /// xor byte [r12 + r13 + disp], imm8
    pub fn xor_byte_sp(&mut self, disp: i32, value: u8) {
        self.bytes(&[0x43, 0x80, 0xB4, 0x2C]);
        self.i32(disp);
        self.u8(value);
    }

    /// mov rax, [r14 + disp]
    pub fn load_rax_local(&mut self, disp: i32) {
        self.bytes(&[0x49, 0x8B, 0x86]);
        self.i32(disp);
    }

    /// mov [r14 + disp], rax
    pub fn store_rax_local(&mut self, disp: i32) {
        self.bytes(&[0x49, 0x89, 0x86]);
        self.i32(disp);
    }

    /// cmp byte [r14 + disp], imm8
    pub fn cmp_byte_local(&mut self, disp: i32, value: u8) {
        self.bytes(&[0x41, 0x80, 0xBE]);
        self.i32(disp);
        self.u8(value);
    }

    // =========================================================================
    // Stack top arithmetic
    // =========================================================================

    /// add r13, imm8 (push slots)
    pub fn add_sp(&mut self, bytes: i8) {
        self.bytes(&[0x49, 0x83, 0xC5, bytes as u8]);
    }

    /// sub r13, imm8 (pop slots)
    pub fn sub_sp(&mut self, bytes: i8) {
        self.bytes(&[0x49, 0x83, 0xED, bytes as u8]);
    }

    /// r13 = (r14 - r12) + imm8 — reset the stack top relative to the
    /// frame base (the inline return sequence).
    pub fn set_sp_to_frame_base_plus(&mut self, bytes: i8) {
        self.bytes(&[0x4D, 0x89, 0xF5]); // mov r13, r14
        self.bytes(&[0x4D, 0x29, 0xE5]); // sub r13, r12
        self.bytes(&[0x49, 0x83, 0xC5, bytes as u8]); // add r13, imm8
    }

    // =========================================================================
    // SSE
    // =========================================================================

    /// movsd xmm{0,1}, [r12 + r13 + disp]
    pub fn movsd_load(&mut self, xmm: u8, disp: i32) {
        debug_assert!(xmm < 2);
        self.bytes(&[0xF2, 0x43, 0x0F, 0x10, 0x84 | (xmm << 3), 0x2C]);
        self.i32(disp);
    }

    /// movsd [r12 + r13 + disp], xmm0
    pub fn movsd_store_xmm0(&mut self, disp: i32) {
        self.bytes(&[0xF2, 0x43, 0x0F, 0x11, 0x84, 0x2C]);
        self.i32(disp);
    }

    /// op xmm0, xmm1 for the F2 0F xx scalar-double family.
    pub fn sse_op_xmm0_xmm1(&mut self, op: u8) {
        self.bytes(&[0xF2, 0x0F, op, 0xC1]);
    }

    /// ucomisd xmm\<a\>, xmm\<b\>
    pub fn ucomisd(&mut self, a: u8, b: u8) {
        debug_assert!(a < 8 && b < 8);
        self.bytes(&[0x66, 0x0F, 0x2E, 0xC0 | (a << 3) | b]);
    }

    /// xorpd xmm2, xmm2 (a zero for divide checks)
    pub fn zero_xmm2(&mut self) {
        self.bytes(&[0x66, 0x0F, 0x57, 0xD2]);
    }

    /// ucomisd xmm1, xmm2 (compare divisor against zero)
    pub fn ucomisd_xmm1_xmm2(&mut self) {
        self.bytes(&[0x66, 0x0F, 0x2E, 0xCA]);
    }

    /// movq xmm0, rax / movq xmm1, rax
    pub fn movq_xmm_rax(&mut self, xmm: u8) {
        debug_assert!(xmm < 2);
        self.bytes(&[0x66, 0x48, 0x0F, 0x6E, 0xC0 | (xmm << 3)]);
    }

    /// xorpd xmm0, xmm1 (sign flip for negate)
    pub fn xorpd_xmm0_xmm1(&mut self) {
        self.bytes(&[0x66, 0x0F, 0x57, 0xC1]);
    }

    // =========================================================================
    // Flags & branches
    // =========================================================================

    pub fn setcc_al(&mut self, cond: u8) {
        self.bytes(&[0x0F, 0x90 | cond, 0xC0]);
    }

    pub fn setcc_cl(&mut self, cond: u8) {
        self.bytes(&[0x0F, 0x90 | cond, 0xC1]);
    }

    pub fn and_al_cl(&mut self) {
        self.bytes(&[0x20, 0xC8]);
    }

    pub fn or_al_cl(&mut self) {
        self.bytes(&[0x08, 0xC8]);
    }

    pub fn test_eax_eax(&mut self) {
        self.bytes(&[0x85, 0xC0]);
    }

    /// cmp eax, imm8
    pub fn cmp_eax_imm8(&mut self, value: u8) {
        self.bytes(&[0x83, 0xF8, value]);
    }

    /// jcc rel32 with a placeholder; returns the patch position.
    pub fn jcc(&mut self, cond: u8) -> usize {
        self.bytes(&[0x0F, 0x80 | cond]);
        let at = self.pos();
        self.i32(0);
        at
    }

    /// jmp rel32 with a placeholder; returns the patch position.
    pub fn jmp(&mut self) -> usize {
        self.u8(0xE9);
        let at = self.pos();
        self.i32(0);
        at
    }

    /// Patch a previously emitted rel32 to land on `target`.
    pub fn patch_rel32(&mut self, at: usize, target: usize) {
        let rel = target as i64 - (at as i64 + 4);
        self.code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    /// Patch a previously emitted rel32 to land here.
    pub fn patch_to_here(&mut self, at: usize) {
        let here = self.pos();
        self.patch_rel32(at, here);
    }

    // =========================================================================
    // Helper calls
    // =========================================================================

    /// Call `helper(ctx, operand)`: syncs the stack top out, makes the
    /// call, reloads the stack top. The caller checks `eax`.
    pub fn call_helper(&mut self, helper: usize, operand: u32) {
        self.sync_sp_to_ctx();
        self.bytes(&[0x48, 0x89, 0xDF]); // mov rdi, rbx
        self.u8(0xBE); // mov esi, imm32
        self.i32(operand as i32);
        self.mov_rax_imm64(helper as u64);
        self.bytes(&[0xFF, 0xD0]); // call rax
        self.load_sp_from_ctx();
    }

    /// Call a pure `f(f64, f64) -> f64` helper; arguments already in
    /// xmm0/xmm1, result in xmm0. No context traffic.
    pub fn call_f64_helper(&mut self, helper: usize) {
        self.mov_rax_imm64(helper as u64);
        self.bytes(&[0xFF, 0xD0]); // call rax
    }
}

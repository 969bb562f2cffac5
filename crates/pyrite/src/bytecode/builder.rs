//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` provides methods for emitting opcodes and operands, handling
//! forward jumps with patching, and recording source spans for error reporting.

use super::{
    code::{Code, LocationEntry},
    op::Opcode,
};
use crate::{intern::StringId, parse::CodeRange};

/// Builder for one instruction sequence (the module body or a function body).
///
/// Handles encoding opcodes and operands into raw bytes, managing forward
/// jumps that need patching, tracking the stack-depth high-water mark, and
/// recording source spans so every failing instruction can report a location.
#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    /// The bytecode being built.
    bytecode: Vec<u8>,

    /// Source span entries for error reporting.
    location_table: Vec<LocationEntry>,

    /// Current source span (set before emitting instructions).
    current_span: Option<CodeRange>,

    /// Current stack depth for tracking max stack usage.
    current_stack_depth: u16,

    /// Maximum stack depth seen during compilation.
    max_stack_depth: u16,

    /// Set when a jump offset does not fit its i16 operand.
    jump_overflow: bool,

    /// Local variable names indexed by slot number, for NameError messages.
    local_names: Vec<StringId>,
}

impl CodeBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the source span recorded for subsequently emitted instructions.
    pub(crate) fn set_span(&mut self, span: CodeRange) {
        self.current_span = Some(span);
    }

    /// Emits a no-operand instruction and updates stack depth tracking.
    pub(crate) fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand.
    pub(crate) fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with an i8 operand.
    pub(crate) fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand.to_ne_bytes()[0]);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub(crate) fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        match op {
            // BuildList pops n, pushes 1
            Opcode::BuildList => self.adjust_stack(1 - operand.cast_signed()),
            // BuildDict pops 2n key-value pairs, pushes 1
            Opcode::BuildDict => self.adjust_stack(1 - 2 * operand.cast_signed()),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
    }

    /// Emits `CallFunction` with its argument count.
    ///
    /// Pops the callee and the arguments, pushes the result.
    pub(crate) fn emit_call_function(&mut self, arg_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::CallFunction as u8);
        self.bytecode.push(arg_count);
        self.adjust_stack(-i16::from(arg_count));
    }

    /// Emits `CallBuiltin`: builtin id (u8) + argument count (u8).
    ///
    /// Pops the arguments, pushes the result; no callee on the stack.
    pub(crate) fn emit_call_builtin(&mut self, builtin_id: u8, arg_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::CallBuiltin as u8);
        self.bytecode.push(builtin_id);
        self.bytecode.push(arg_count);
        self.adjust_stack(1 - i16::from(arg_count));
    }

    /// Emits `CallMethod`: method name id (u16) + argument count (u8).
    ///
    /// Pops the receiver and the arguments, pushes the result.
    pub(crate) fn emit_call_method(&mut self, name_id: u16, arg_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::CallMethod as u8);
        self.bytecode.extend_from_slice(&name_id.to_le_bytes());
        self.bytecode.push(arg_count);
        self.adjust_stack(-i16::from(arg_count));
    }

    /// Emits `MakeClosure` with the enclosing-frame cell indices to capture.
    pub(crate) fn emit_make_closure(&mut self, function_id: u16, captures: &[u8]) {
        self.start_instruction();
        self.bytecode.push(Opcode::MakeClosure as u8);
        self.bytecode.extend_from_slice(&function_id.to_le_bytes());
        self.bytecode.push(u8::try_from(captures.len()).unwrap_or(u8::MAX));
        self.bytecode.extend_from_slice(captures);
        self.adjust_stack(1);
    }

    /// Emits `BuildClass` with the inline method table.
    pub(crate) fn emit_build_class(&mut self, name_id: u16, methods: &[(u16, u16)]) {
        self.start_instruction();
        self.bytecode.push(Opcode::BuildClass as u8);
        self.bytecode.extend_from_slice(&name_id.to_le_bytes());
        self.bytecode.push(u8::try_from(methods.len()).unwrap_or(u8::MAX));
        for &(method_name, function_id) in methods {
            self.bytecode.extend_from_slice(&method_name.to_le_bytes());
            self.bytecode.extend_from_slice(&function_id.to_le_bytes());
        }
        self.adjust_stack(1);
    }

    /// Emits `Input`, popping the prompt when one was pushed.
    pub(crate) fn emit_input(&mut self, has_prompt: bool) {
        self.start_instruction();
        self.bytecode.push(Opcode::Input as u8);
        self.bytecode.push(u8::from(has_prompt));
        self.adjust_stack(if has_prompt { 0 } else { 1 });
    }

    /// Emits a forward jump instruction, returning a label to patch later.
    ///
    /// The jump offset is initially set to 0 and must be patched with
    /// `patch_jump()` once the target location is known.
    #[must_use]
    pub(crate) fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        // Placeholder for i16 offset (will be patched)
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        match op {
            // ForIter pushes the next value on the fallthrough path; the
            // iterator pop on the exhausted path happens past the loop
            Opcode::ForIter => self.adjust_stack(1),
            // these pop only when not jumping (fallthrough)
            Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => self.adjust_stack(-1),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
        label
    }

    /// Patches a forward jump to point to the current bytecode location.
    ///
    /// The offset is calculated relative to the position after the jump
    /// instruction's operand (i.e., where execution would continue if
    /// the jump is not taken). An offset past the i16 range sets the
    /// overflow flag instead of truncating.
    pub(crate) fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        // Offset is relative to position after the jump instruction (opcode + i16 = 3 bytes)
        let target_i64 = i64::try_from(target).unwrap_or(i64::MAX);
        let label_i64 = i64::try_from(label.0).unwrap_or(i64::MAX);
        let Ok(offset) = i16::try_from(target_i64 - label_i64 - 3) else {
            self.jump_overflow = true;
            return;
        };
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to a known target offset.
    ///
    /// Unlike forward jumps, backward jumps have a known target at emit time,
    /// so no patching is needed. An offset past the i16 range sets the
    /// overflow flag instead of truncating.
    pub(crate) fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let current = self.bytecode.len();
        // Offset is relative to position after this instruction (current + 3)
        let target_i64 = i64::try_from(target).unwrap_or(i64::MAX);
        let current_i64 = i64::try_from(current).unwrap_or(i64::MAX);
        let offset = match i16::try_from(target_i64 - (current_i64 + 3)) {
            Ok(offset) => offset,
            Err(_) => {
                self.jump_overflow = true;
                0
            }
        };
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Whether any jump offset overflowed its i16 operand.
    ///
    /// The compiler checks this when a body is finished and reports the
    /// oversized body as a compile error.
    #[must_use]
    pub(crate) fn jump_overflow(&self) -> bool {
        self.jump_overflow
    }

    /// Returns the current bytecode offset.
    ///
    /// Use this to record loop start positions for backward jumps.
    #[must_use]
    pub(crate) fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Current tracked stack depth.
    #[must_use]
    pub(crate) fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Resets the tracked depth where control flow reconverges.
    ///
    /// Jumps make the linear depth model diverge from execution (a `break`
    /// leaves the loop, the exhausted `ForIter` path pops the iterator); the
    /// compiler restores the known depth at the join point.
    pub(crate) fn set_stack_depth(&mut self, depth: u16) {
        self.current_stack_depth = depth;
    }

    /// Emits a `LoadLocal`, widening the operand for slots past 255.
    pub(crate) fn emit_load_local(&mut self, slot: u16) {
        if let Ok(s) = u8::try_from(slot) {
            self.emit_u8(Opcode::LoadLocal, s);
        } else {
            self.emit_u16(Opcode::LoadLocalW, slot);
        }
    }

    /// Emits a `StoreLocal`, widening the operand for slots past 255.
    pub(crate) fn emit_store_local(&mut self, slot: u16) {
        if let Ok(s) = u8::try_from(slot) {
            self.emit_u8(Opcode::StoreLocal, s);
        } else {
            self.emit_u16(Opcode::StoreLocalW, slot);
        }
    }

    /// Registers a local variable name for a given slot.
    ///
    /// The name is used to generate proper NameError messages when a local
    /// is read before assignment.
    pub(crate) fn register_local_name(&mut self, slot: u16, name: StringId) {
        let slot_idx = slot as usize;
        if slot_idx >= self.local_names.len() {
            self.local_names.resize(slot_idx + 1, StringId::default());
        }
        self.local_names[slot_idx] = name;
    }

    /// Builds the final Code object.
    #[must_use]
    pub(crate) fn build(self, num_locals: u16) -> Code {
        Code::new(
            self.bytecode,
            self.location_table,
            self.local_names,
            num_locals,
            self.max_stack_depth,
        )
    }

    /// Records instruction start metadata before opcode emission.
    fn start_instruction(&mut self) {
        if let Some(span) = self.current_span {
            let offset = u32::try_from(self.bytecode.len()).unwrap_or(u32::MAX);
            self.location_table.push(LocationEntry::new(offset, span));
        }
    }

    /// Adjusts the stack depth by the given delta.
    ///
    /// Positive values indicate pushes, negative values indicate pops.
    /// Updates `max_stack_depth` if the new depth exceeds it.
    fn adjust_stack(&mut self, delta: i16) {
        let new_depth = i32::from(self.current_stack_depth) + i32::from(delta);
        // Stack depth shouldn't go negative (indicates compiler bug)
        debug_assert!(new_depth >= 0, "stack depth went negative: {new_depth}");
        self.current_stack_depth = u16::try_from(new_depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}

/// Label for a forward jump that needs patching.
///
/// Stores the bytecode offset where the jump instruction was emitted.
/// Pass this to `patch_jump()` once the target location is known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::Pop);

        let code = builder.build(0);
        assert_eq!(code.bytecode(), &[Opcode::LoadNone as u8, Opcode::Pop as u8]);
    }

    #[test]
    fn emit_u16_operand_is_little_endian() {
        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::LoadConst, 0x1234);

        let code = builder.build(0);
        assert_eq!(code.bytecode(), &[Opcode::LoadConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn forward_jump_patching() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::LoadNone); // 1 byte, skipped by jump
        builder.emit(Opcode::LoadNone); // 1 byte, skipped by jump
        builder.patch_jump(jump);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::ReturnValue);

        let code = builder.build(0);
        // Jump at offset 0, target at offset 5 (after 2x LoadNone)
        // Offset = 5 - 0 - 3 = 2
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::Jump as u8,
                2,
                0, // i16 little-endian = 2
                Opcode::LoadNone as u8,
                Opcode::LoadNone as u8,
                Opcode::LoadNone as u8,
                Opcode::ReturnValue as u8,
            ]
        );
    }

    #[test]
    fn backward_jump() {
        let mut builder = CodeBuilder::new();
        let loop_start = builder.current_offset();
        builder.emit(Opcode::LoadNone); // offset 0, 1 byte
        builder.emit(Opcode::Pop); // offset 1, 1 byte
        builder.emit_jump_to(Opcode::Jump, loop_start); // offset 2, target 0

        let code = builder.build(0);
        // Jump at offset 2, target at offset 0
        // Offset = 0 - (2 + 3) = -5
        let expected_offset = (-5i16).to_le_bytes();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadNone as u8,
                Opcode::Pop as u8,
                Opcode::Jump as u8,
                expected_offset[0],
                expected_offset[1],
            ]
        );
    }

    #[test]
    fn local_slot_widening() {
        let mut builder = CodeBuilder::new();
        builder.emit_load_local(4);
        builder.emit_load_local(256);

        let code = builder.build(0);
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadLocal as u8,
                4,
                Opcode::LoadLocalW as u8,
                0,
                1, // 256 in little-endian
            ]
        );
    }

    #[test]
    fn stack_depth_tracks_high_water_mark() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::LoadNone);
        builder.emit_u16(Opcode::BuildList, 3);
        builder.emit(Opcode::Pop);

        let code = builder.build(0);
        assert_eq!(code.max_stack_depth(), 3);
    }

    #[test]
    fn forward_jump_overflow_is_flagged() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        for _ in 0..40_000 {
            builder.emit(Opcode::Nop);
        }
        builder.patch_jump(jump);
        assert!(builder.jump_overflow());
    }

    #[test]
    fn backward_jump_overflow_is_flagged() {
        let mut builder = CodeBuilder::new();
        let start = builder.current_offset();
        for _ in 0..40_000 {
            builder.emit(Opcode::Nop);
        }
        builder.emit_jump_to(Opcode::Jump, start);
        assert!(builder.jump_overflow());
    }

    #[test]
    fn in_range_jumps_do_not_flag_overflow() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::Nop);
        builder.patch_jump(jump);
        assert!(!builder.jump_overflow());
    }

    #[test]
    fn input_with_prompt_keeps_depth() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNone); // prompt placeholder
        builder.emit_input(true);
        builder.emit(Opcode::Pop);

        let code = builder.build(0);
        assert_eq!(code.max_stack_depth(), 1);
    }
}

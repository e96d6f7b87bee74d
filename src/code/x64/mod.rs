//! x86-64 control flow encodings

/// Single-byte `nop`, used to pad a detour up to the size of the code it replaces
pub const NOP: u8 = 0x90;

/// Size of a `jmp rel32` / `call rel32`
pub const REL32_LEN: usize = 5;

/// Size of the sequence generated by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;

/// Size of the sequence generated by [`call_abs`]
pub const CALL_ABS_LEN: usize = 16;

/// Computes the displacement of a 5-byte relative branch at `from` landing on `to`.
///
/// Returns `None` when `to` is further than a signed 32-bit displacement can reach.
pub fn rel32(from: usize, to: usize) -> Option<i32> {
    let next = (from as i64).wrapping_add(REL32_LEN as i64);
    i32::try_from((to as i64).wrapping_sub(next)).ok()
}

/// Encodes a relative branch with the given opcode
fn branch_rel32(opcode: u8, from: usize, to: usize) -> Option<[u8; REL32_LEN]> {
    let disp = rel32(from, to)?.to_le_bytes();
    Some([opcode, disp[0], disp[1], disp[2], disp[3]])
}

/// Generates `jmp rel32` placed at `from` and landing on `to`
pub fn jmp_rel32(from: usize, to: usize) -> Option<[u8; REL32_LEN]> {
    branch_rel32(0xe9, from, to)
}

/// Generates `call rel32` placed at `from` and calling `to`
pub fn call_rel32(from: usize, to: usize) -> Option<[u8; REL32_LEN]> {
    branch_rel32(0xe8, from, to)
}

/// Generates an absolute jump to a specified address and returns bytecode
///
/// `jmp [rip + 0]` followed by the 8-byte target
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Generates an absolute call to a specified address and returns bytecode
///
/// `call [rip + 2]; jmp +8` followed by the 8-byte target, so execution resumes right after the sequence
pub fn call_abs(target: usize) -> [u8; CALL_ABS_LEN] {
    let mut code = [0u8; CALL_ABS_LEN];
    code[..8].copy_from_slice(&[0xff, 0x15, 0x02, 0x00, 0x00, 0x00, 0xeb, 0x08]);
    code[8..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

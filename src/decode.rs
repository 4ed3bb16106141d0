//! x86-64 instruction decoding for the fault-trap mechanism.
//!
//! The first fault handler needs two facts about the instruction sitting at
//! the faulting program counter: its total length (to find the trap site
//! immediately after it) and the width of its memory store operand (to know
//! how many bytes to publish in `SYNC_INFO`). Capstone provides both.

use std::io;

use capstone::arch::x86::X86OperandType;
use capstone::arch::ArchOperand;
use capstone::prelude::*;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Facts about a decoded store instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInsn {
    /// Instruction length in bytes.
    pub len: usize,
    /// Width of the memory operand being written, in bytes.
    pub width: usize,
}

/// A configured disassembler for the host ISA.
///
/// Built once at participant initialization; the fault handlers only borrow
/// it. Decoding allocates, which is tolerated in the handlers the same way
/// the protocol tolerates their blocking socket reads: faults only ever
/// interrupt application code, never the runtime itself.
pub struct InsnDecoder {
    cs: Capstone,
}

impl InsnDecoder {
    pub fn new() -> io::Result<InsnDecoder> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .detail(true)
            .build()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        Ok(InsnDecoder { cs })
    }

    /// Decodes the store instruction at the start of `code`.
    ///
    /// Fails when the bytes do not decode, or when the instruction has no
    /// writable memory operand; either means the fault did not come from an
    /// ordinary store and the participant cannot continue.
    pub fn store(&self, code: &[u8]) -> io::Result<StoreInsn> {
        let insns = self
            .cs
            .disasm_count(code, 0x1000, 1)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let insn = insns
            .iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "undecodable instruction"))?;
        let len = insn.bytes().len();

        let detail = self
            .cs
            .insn_detail(insn)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let mut width = None;
        for op in detail.arch_detail().operands() {
            if let ArchOperand::X86Operand(x86) = op {
                if let X86OperandType::Mem(_) = x86.op_type {
                    if x86.access.map_or(false, |acc| acc.is_writable()) {
                        width = Some(x86.size as usize);
                    }
                }
            }
        }

        match width {
            Some(width) => Ok(StoreInsn { len, width }),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "faulting instruction has no memory store operand",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> InsnDecoder {
        InsnDecoder::new().unwrap()
    }

    #[test]
    fn store_widths() {
        // mov byte ptr [rdi], al
        assert_eq!(
            decoder().store(&[0x88, 0x07]).unwrap(),
            StoreInsn { len: 2, width: 1 }
        );
        // mov word ptr [rdi], ax
        assert_eq!(
            decoder().store(&[0x66, 0x89, 0x07]).unwrap(),
            StoreInsn { len: 3, width: 2 }
        );
        // mov dword ptr [rdi], 0x1
        assert_eq!(
            decoder()
                .store(&[0xc7, 0x07, 0x01, 0x00, 0x00, 0x00])
                .unwrap(),
            StoreInsn { len: 6, width: 4 }
        );
        // mov qword ptr [rdi], rax
        assert_eq!(
            decoder().store(&[0x48, 0x89, 0x07]).unwrap(),
            StoreInsn { len: 3, width: 8 }
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        // The handler always hands over a full 15-byte window.
        let mut code = [0x90u8; MAX_INSN_LEN];
        code[..3].copy_from_slice(&[0x48, 0x89, 0x07]);
        assert_eq!(decoder().store(&code).unwrap().len, 3);
    }

    #[test]
    fn loads_are_not_stores() {
        // mov eax, dword ptr [rdi]
        assert!(decoder().store(&[0x8b, 0x07]).is_err());
    }
}

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use strum_macros::EnumString;

/// x86-64 registers used to pass integer arguments.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    R8,
    R9,
}

/// Calling convention of the debugee native code.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    /// Microsoft x64.
    Win64,
    /// System V AMD64.
    #[default]
    SysV,
    /// 32-bit stack based conventions, no argument registers.
    Cdecl32,
}

impl CallingConvention {
    /// Registers holding integer arguments, in argument order.
    pub fn argument_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::Win64 => &[Register::Rcx, Register::Rdx, Register::R8, Register::R9],
            CallingConvention::SysV => &[
                Register::Rdi,
                Register::Rsi,
                Register::Rdx,
                Register::Rcx,
                Register::R8,
                Register::R9,
            ],
            CallingConvention::Cdecl32 => &[],
        }
    }

    /// Register of the integer argument at `index`, `None` if it is passed on the stack.
    pub fn argument_register(self, index: usize) -> Option<Register> {
        self.argument_registers().get(index).copied()
    }

    pub fn passes_arguments_in_registers(self) -> bool {
        !self.argument_registers().is_empty()
    }
}

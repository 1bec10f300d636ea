//! Commands from the Command Processor and the per-box state machine.

use std::fmt;

use crate::regs::{GpuRegData, GpuRegister};

/// Command delivered to the Rasterizer and, from there, to each stage box.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterizerCommand {
    Reset,
    RegisterWrite {
        reg: GpuRegister,
        subreg: u32,
        data: GpuRegData,
    },
    Draw,
    End,
    ClearColor,
    ClearZStencil,
    Swap,
    FrameChange,
    DumpColor,
    DumpDepth,
    DumpStencil,
    Flush,
    SaveState,
    RestoreState,
    ResetState,
    Blit,
}

impl RasterizerCommand {
    pub fn write(reg: GpuRegister, subreg: u32, data: GpuRegData) -> Self {
        Self::RegisterWrite { reg, subreg, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterizerState {
    Reset,
    Ready,
    Drawing,
    Busy,
    End,
    Swap,
    Flush,
    SaveState,
    RestoreState,
    ResetState,
    Blit,
    Clear,
    ClearEnd,
    DumpBuffer,
}

impl fmt::Display for RasterizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reset => "RAST_RESET",
            Self::Ready => "RAST_READY",
            Self::Drawing => "RAST_DRAWING",
            Self::Busy => "RAST_BUSY",
            Self::End => "RAST_END",
            Self::Swap => "RAST_SWAP",
            Self::Flush => "RAST_FLUSH",
            Self::SaveState => "RAST_SAVE_STATE",
            Self::RestoreState => "RAST_RESTORE_STATE",
            Self::ResetState => "RAST_RESET_STATE",
            Self::Blit => "RAST_BLIT",
            Self::Clear => "RAST_CLEAR",
            Self::ClearEnd => "RAST_CLEAR_END",
            Self::DumpBuffer => "RAST_DUMP_BUFFER",
        };
        f.write_str(s)
    }
}

impl RasterizerState {
    /// States in which a box has finished its current operation and waits
    /// for the `End` acknowledgement.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::End | Self::ClearEnd)
    }
}

/// Panic for a command the box cannot process in its current state.
pub fn unsupported(box_name: &str, state: RasterizerState, command: &RasterizerCommand) -> ! {
    panic!("{box_name}: command {command:?} not supported in state {state}")
}

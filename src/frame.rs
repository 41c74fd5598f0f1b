use std::fmt;

use crate::frame_address::FrameAddress;

/// The strategy used to capture a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureMethod {
    /// The platform's built-in backtrace facility, through the `backtrace` crate.
    BuiltinBacktrace,
    /// The unwinder engine: cached rules, CFI, frame-pointer fallback.
    UnwindLibrary,
    /// CFI only, one explicit lookup per frame.
    DebugInfo,
    /// The frame pointer chain only.
    FramePointer,
    /// The unwinder engine, run against a stopped target process.
    RemoteUnwindLibrary,
    /// CFI stepping, run against a stopped target process.
    RemoteDebugInfo,
}

impl CaptureMethod {
    pub const ALL: [CaptureMethod; 6] = [
        CaptureMethod::BuiltinBacktrace,
        CaptureMethod::UnwindLibrary,
        CaptureMethod::DebugInfo,
        CaptureMethod::FramePointer,
        CaptureMethod::RemoteUnwindLibrary,
        CaptureMethod::RemoteDebugInfo,
    ];

    pub const LOCAL: [CaptureMethod; 4] = [
        CaptureMethod::BuiltinBacktrace,
        CaptureMethod::UnwindLibrary,
        CaptureMethod::DebugInfo,
        CaptureMethod::FramePointer,
    ];

    pub const REMOTE: [CaptureMethod; 2] = [
        CaptureMethod::RemoteUnwindLibrary,
        CaptureMethod::RemoteDebugInfo,
    ];

    pub fn is_remote(self) -> bool {
        matches!(
            self,
            CaptureMethod::RemoteUnwindLibrary | CaptureMethod::RemoteDebugInfo
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            CaptureMethod::BuiltinBacktrace => "builtin-backtrace",
            CaptureMethod::UnwindLibrary => "unwind-library",
            CaptureMethod::DebugInfo => "debug-info",
            CaptureMethod::FramePointer => "frame-pointer",
            CaptureMethod::RemoteUnwindLibrary => "remote-unwind-library",
            CaptureMethod::RemoteDebugInfo => "remote-debug-info",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The process whose stack is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// The calling thread.
    SelfProcess,
    /// Another live process, by pid.
    Process(i32),
}

/// Why a stack walk ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The outermost frame was reached.
    EndOfStack,
    /// The trace reached the configured maximum depth.
    DepthLimit,
    /// No unwind information covers the next frame.
    NotFound,
    /// The unwind information covering the next frame is malformed.
    ParseFailure,
    /// The frame chain is inconsistent: it moves backwards, is misaligned, or does not
    /// advance.
    ChainCorrupted,
    /// Stack memory needed for the next step could not be read.
    StackReadFailed,
}

/// A function name with the offset of the frame's address from the function start.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub offset: u64,
}

/// The binary image containing a frame's address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleRef {
    pub path: String,
    /// The load bias: AVMA minus SVMA.
    pub base: u64,
}

/// One activation record of a captured stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Frame {
    address: FrameAddress,
    symbol: Option<Symbol>,
    module: Option<ModuleRef>,
}

impl Frame {
    pub fn new(address: FrameAddress) -> Self {
        Self {
            address,
            symbol: None,
            module: None,
        }
    }

    /// The instruction pointer value of this frame.
    pub fn address(&self) -> u64 {
        self.address.address()
    }

    pub fn frame_address(&self) -> FrameAddress {
        self.address
    }

    pub fn symbol(&self) -> Option<&Symbol> {
        self.symbol.as_ref()
    }

    pub fn module(&self) -> Option<&ModuleRef> {
        self.module.as_ref()
    }

    pub(crate) fn set_symbol(&mut self, symbol: Option<Symbol>) {
        self.symbol = symbol;
    }

    pub(crate) fn set_module(&mut self, module: Option<ModuleRef>) {
        self.module = module;
    }

    /// `name+0xoffset`, or `<unknown>`.
    pub fn render(&self) -> String {
        match &self.symbol {
            Some(symbol) => format!("{}+0x{:x}", symbol.name, symbol.offset),
            None => "<unknown>".to_string(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x} {}", self.address(), self.render())?;
        if let Some(module) = &self.module {
            write!(f, " ({})", module.path)?;
        }
        Ok(())
    }
}

/// A captured stack, innermost frame first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackTrace {
    frames: Vec<Frame>,
    method: CaptureMethod,
    target: Target,
    stop_reason: StopReason,
}

impl StackTrace {
    pub fn new(
        method: CaptureMethod,
        target: Target,
        frames: Vec<Frame>,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            frames,
            method,
            target,
            stop_reason,
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn method(&self) -> CaptureMethod {
        self.method
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.frames.iter().map(Frame::address).collect()
    }

    /// One `name+0xoffset` or `<unknown>` string per frame.
    pub fn render(&self) -> Vec<String> {
        self.frames.iter().map(Frame::render).collect()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "#{i:<3} {frame}")?;
        }
        Ok(())
    }
}

/// Collects frames up to a maximum depth.
pub(crate) struct TraceBuilder {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl TraceBuilder {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max_depth.min(256)),
            max_depth,
        }
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_depth
    }

    /// Append a frame. Returns `false` if the trace was already full and the frame was
    /// dropped.
    pub fn push(&mut self, address: FrameAddress) -> bool {
        if self.is_full() {
            return false;
        }
        self.frames.push(Frame::new(address));
        true
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

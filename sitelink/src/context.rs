use std::{fmt, sync::Arc};

use bitflags::bitflags;

use crate::{CallResult, RaiseError, Runtime, Symbol, TypeRef, Value};

bitflags! {
    /// Per-call facts the caller hands to the callee's arity check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallInfo: u8 {
        /// the last positional argument is a keyword hash
        const KWARGS = 1 << 0;
    }
}

/// Why a call ended up in `method_missing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingReason {
    #[default]
    Normal,
    Private,
    /// bare identifier that might have been a local variable
    Variable,
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

/// Activation record visible to blocks and diagnostics.
#[derive(Debug, Clone)]
pub struct Frame {
    pub self_value: Value,
    pub module: Option<TypeRef>,
    pub name: Option<Symbol>,
}

/// Per-thread execution state. Not shared between threads.
pub struct ThreadContext {
    id: ContextId,
    runtime: Arc<Runtime>,
    frames: Vec<Frame>,
    call_info: CallInfo,
    missing_reason: MissingReason,
    polls: u64,
}

impl Frame {
    pub fn new(self_value: Value, module: TypeRef, name: Symbol) -> Self {
        Self {
            self_value,
            module: Some(module),
            name: Some(name),
        }
    }

    pub fn top(self_value: Value) -> Self {
        Self {
            self_value,
            module: None,
            name: None,
        }
    }
}

impl ThreadContext {
    pub(crate) fn new(id: ContextId, runtime: Arc<Runtime>) -> Self {
        Self {
            id,
            runtime,
            frames: vec![Frame::top(Value::Nil)],
            call_info: CallInfo::empty(),
            missing_reason: MissingReason::Normal,
            polls: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        // the top level frame stays
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    pub fn current_frame(&self) -> &Frame {
        // never empty, see pop_frame
        &self.frames[self.frames.len() - 1]
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn set_call_info(&mut self, info: CallInfo) {
        self.call_info = info;
    }

    /// Read and clear the flags set for the call being entered.
    #[inline]
    pub fn take_call_info(&mut self) -> CallInfo {
        std::mem::take(&mut self.call_info)
    }

    pub fn call_info(&self) -> CallInfo {
        self.call_info
    }

    pub fn set_missing_reason(&mut self, reason: MissingReason) {
        self.missing_reason = reason;
    }

    pub fn take_missing_reason(&mut self) -> MissingReason {
        std::mem::take(&mut self.missing_reason)
    }

    /// Handle events queued for this thread at a safepoint.
    pub fn poll_thread_events(&mut self) -> Result<(), RaiseError> {
        self.polls += 1;
        match self.runtime.take_interrupt(self.id) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// `method_missing` default: raise the error matching `reason`.
    pub fn raise_missing(&mut self, receiver: &Value, args: &[Value]) -> CallResult {
        let reason = self.take_missing_reason();
        let name = match args.first() {
            Some(Value::Symbol(name)) => name.to_string(),
            _ => {
                return Err(RaiseError::argument_count(0, "1+"));
            }
        };
        let receiver = self.runtime.describe(receiver);
        Err(match reason {
            MissingReason::Private => RaiseError::PrivateMethodError { name, receiver },
            MissingReason::Variable => RaiseError::NameError { name, receiver },
            MissingReason::Normal | MissingReason::Functional => {
                RaiseError::NoMethodError { name, receiver }
            }
        })
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.runtime.release_context(self.id);
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("frames", &self.frames.len())
            .field("call_info", &self.call_info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeCreateInfo;

    #[test]
    fn call_info_is_consumed_once() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let mut ctx = runtime.new_context();
        ctx.set_call_info(CallInfo::KWARGS);
        assert!(ctx.take_call_info().contains(CallInfo::KWARGS));
        assert!(ctx.take_call_info().is_empty(), "flags apply to one call only");
    }

    #[test]
    fn keyword_hashes_are_the_only_call_fact() {
        assert_eq!(CallInfo::all(), CallInfo::KWARGS);
    }

    #[test]
    fn the_top_frame_is_never_popped() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let mut ctx = runtime.new_context();
        let object = runtime.object_class().clone();
        ctx.push_frame(Frame::new(Value::Nil, object, runtime.symbol("foo")));
        assert_eq!(ctx.frame_depth(), 2);
        assert!(ctx.pop_frame().is_some());
        assert!(ctx.pop_frame().is_none());
        assert_eq!(ctx.frame_depth(), 1);
        assert!(ctx.current_frame().name.is_none());
    }

    #[test]
    fn missing_reason_selects_the_error_kind() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let mut ctx = runtime.new_context();
        let args = [Value::Symbol(runtime.symbol("secret"))];

        ctx.set_missing_reason(MissingReason::Private);
        let err = ctx.raise_missing(&Value::Nil, &args).unwrap_err();
        assert_eq!(err.to_string(), "private method `secret' called for nil");

        ctx.set_missing_reason(MissingReason::Variable);
        let err = ctx.raise_missing(&Value::Fixnum(1), &args).unwrap_err();
        assert!(matches!(err, RaiseError::NameError { .. }));

        let err = ctx.raise_missing(&Value::Nil, &args).unwrap_err();
        assert!(
            matches!(err, RaiseError::NoMethodError { .. }),
            "the reason resets after use"
        );
    }
}

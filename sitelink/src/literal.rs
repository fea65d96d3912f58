use std::sync::Arc;

use crate::{CallInfo, CallResult, RHash, RaiseError, ThreadContext, Value};

/// Sets the call-info flags for the call emitted right after it.
#[derive(Debug, Clone, Copy)]
pub struct CallInfoSite {
    flags: CallInfo,
}

impl CallInfoSite {
    pub const fn new(flags: CallInfo) -> Self {
        Self { flags }
    }

    /// Empty flags clear whatever a previous site left behind.
    #[inline]
    pub fn set(&self, ctx: &mut ThreadContext) {
        ctx.set_call_info(self.flags);
    }

    pub fn flags(&self) -> CallInfo {
        self.flags
    }
}

pub fn build_array(values: &[Value]) -> Value {
    Value::Array(Arc::from(values))
}

/// `{k => v, ...}`; a repeated key keeps its first position and the last
/// value.
pub fn build_hash(pairs: &[(Value, Value)]) -> Value {
    let mut hash = RHash::with_capacity(pairs.len());
    for (key, value) in pairs {
        hash.insert(key.clone(), value.clone());
    }
    Value::Hash(Arc::new(hash))
}

/// `**base, k => v`: a fresh hash, `base` is left untouched.
pub fn kwargs_hash(base: &Value, pairs: &[(Value, Value)]) -> CallResult {
    let Some(base) = base.as_hash() else {
        return Err(RaiseError::TypeError(format!(
            "no implicit conversion of {base} into Hash"
        )));
    };
    let mut hash = base.clone();
    for (key, value) in pairs {
        hash.insert(key.clone(), value.clone());
    }
    Ok(Value::Hash(Arc::new(hash)))
}

//! One builder per method implementation. Each returns the tightest bound
//! thunk it can for a call shape, or `None` to leave the site on the generic
//! bound thunk. Whatever is built must behave exactly like
//! `DynamicMethod::call`.
use std::sync::Arc;

use crate::{
    ArityCheck, AttrMethod, BoundThunk, CacheEntry, CallShape, CompiledMethod, HandleMethod,
    LinkerOptions, MethodImpl, MissingReason, NativeMethod, Symbol, ThunkKind, TypeRef, Value,
    call_native, enter_compiled, invoke_compiled, invoke_handle, invoke_native, invoker,
    read_variable, write_variable,
};

pub fn specialize(
    name: &Symbol,
    shape: &CallShape,
    receiver_type: &TypeRef,
    entry: &CacheEntry,
    options: &LinkerOptions,
) -> Option<BoundThunk> {
    match entry.method.implementation() {
        MethodImpl::Native(native) if options.native_binding => {
            specialize_native(name, shape, entry, *native)
        }
        MethodImpl::Handle(handle) if options.native_binding => {
            specialize_handle(shape, entry, *handle)
        }
        MethodImpl::Compiled(compiled) if options.compiled_binding => {
            Some(specialize_compiled(name, shape, entry, compiled.clone()))
        }
        // still interpreted: stay generic until promotion revokes the guard
        MethodImpl::MixedMode(mixed) if options.compiled_binding => mixed
            .jitted()
            .map(|compiled| specialize_compiled(name, shape, entry, compiled)),
        MethodImpl::AttrReader(attr) if options.attr_binding => {
            specialize_attr_reader(shape, receiver_type, entry, attr)
        }
        MethodImpl::AttrWriter(attr) if options.attr_binding => {
            specialize_attr_writer(shape, receiver_type, entry, attr)
        }
        _ => None,
    }
}

fn specialize_native(
    name: &Symbol,
    shape: &CallShape,
    entry: &CacheEntry,
    native: NativeMethod,
) -> Option<BoundThunk> {
    let arity = native.arity()?;
    let module = entry.source_module.clone();
    let name = name.clone();
    let exact = arity >= 0
        && shape.arg_count == arity
        && native.signature().check_for_shape(shape.arg_count) == ArityCheck::Accepted;

    let invoke = if exact {
        invoker(move |ctx, receiver, args, block| {
            invoke_native(ctx, &native, receiver, &module, &name, args, block)
        })
    } else if arity == -1 {
        // the primitive takes the whole argument list, count checked per call
        invoker(move |ctx, receiver, args, block| {
            call_native(ctx, &native, receiver, &module, &name, args, block)
        })
    } else {
        return None;
    };
    Some(BoundThunk::new(ThunkKind::Native, entry.clone(), invoke))
}

fn specialize_handle(
    shape: &CallShape,
    entry: &CacheEntry,
    handle: HandleMethod,
) -> Option<BoundThunk> {
    let specific = usize::try_from(shape.arg_count)
        .ok()
        .and_then(|arity| handle.handle(arity));
    let invoke = match specific {
        Some(function) => invoker(move |ctx, receiver, args, block| {
            ctx.take_call_info();
            function(ctx, receiver, args, block)
        }),
        None if handle.variadic().is_some() => invoker(move |ctx, receiver, args, block| {
            invoke_handle(ctx, &handle, receiver, args, block)
        }),
        None => return None,
    };
    Some(BoundThunk::new(ThunkKind::Handle, entry.clone(), invoke))
}

fn specialize_compiled(
    name: &Symbol,
    shape: &CallShape,
    entry: &CacheEntry,
    method: Arc<CompiledMethod>,
) -> BoundThunk {
    let module = entry.source_module.clone();
    let name = name.clone();

    let invoke = match method.signature().check_for_shape(shape.arg_count) {
        ArityCheck::Accepted => {
            // the count always fits, skip the per-call check
            let body = method
                .specific(shape.arg_count as usize)
                .unwrap_or(method.entry());
            invoker(move |ctx, receiver, args, block| {
                ctx.take_call_info();
                enter_compiled(ctx, &method, body, receiver, &module, &name, args, block)
            })
        }
        ArityCheck::Rejected { .. } | ArityCheck::Dynamic => {
            invoker(move |ctx, receiver, args, block| {
                invoke_compiled(ctx, &method, receiver, &module, &name, args, block)
            })
        }
    };
    BoundThunk::new(ThunkKind::Compiled, entry.clone(), invoke)
}

fn specialize_attr_reader(
    shape: &CallShape,
    receiver_type: &TypeRef,
    entry: &CacheEntry,
    attr: &AttrMethod,
) -> Option<BoundThunk> {
    if shape.arg_count != 0 || shape.has_block {
        return None;
    }
    let accessor = receiver_type.variable_accessor_for_write(attr.variable());
    Some(BoundThunk::new(
        ThunkKind::AttrReader,
        entry.clone(),
        invoker(move |ctx, receiver, _args, _block| {
            ctx.take_call_info();
            Ok(read_variable(&accessor, receiver))
        }),
    ))
}

fn specialize_attr_writer(
    shape: &CallShape,
    receiver_type: &TypeRef,
    entry: &CacheEntry,
    attr: &AttrMethod,
) -> Option<BoundThunk> {
    if shape.arg_count != 1 || shape.has_block {
        return None;
    }
    let accessor = receiver_type.variable_accessor_for_write(attr.variable());
    Some(BoundThunk::new(
        ThunkKind::AttrWriter,
        entry.clone(),
        invoker(move |ctx, receiver, args, _block| {
            ctx.take_call_info();
            write_variable(&accessor, receiver, args[0].clone())
        }),
    ))
}

/// Bind the resolved method through its generic calling convention.
pub fn generic_thunk(name: &Symbol, entry: &CacheEntry) -> BoundThunk {
    let method = entry.method.clone();
    let module = entry.source_module.clone();
    let name = name.clone();
    BoundThunk::new(
        ThunkKind::Generic,
        entry.clone(),
        invoker(move |ctx, receiver, args, block| {
            method.call(ctx, receiver, &module, &name, args, block)
        }),
    )
}

/// Redirect to the receiver's `method_missing`, described by `handler`.
pub fn method_missing_thunk(
    name: &Symbol,
    reason: MissingReason,
    handler: &CacheEntry,
) -> BoundThunk {
    let method = handler.method.clone();
    let module = handler.source_module.clone();
    let handler_name = handler.method.name().clone();
    let name = name.clone();
    BoundThunk::new(
        ThunkKind::MethodMissing,
        handler.clone(),
        invoker(move |ctx, receiver, args, block| {
            let args = missing_arguments(&name, args);
            ctx.set_missing_reason(reason);
            method.call(ctx, receiver, &module, &handler_name, &args, block)
        }),
    )
}

/// `[name, *args]`, the layout `method_missing` receives for any call shape.
pub fn missing_arguments(name: &Symbol, args: &[Value]) -> Vec<Value> {
    let mut packed = Vec::with_capacity(args.len() + 1);
    packed.push(Value::Symbol(name.clone()));
    packed.extend_from_slice(args);
    packed
}

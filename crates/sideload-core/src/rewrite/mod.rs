//! Type rewriter
//!
//! Retrofits a unit, before it is defined, so that caller code can drive it
//! through capability interfaces:
//!
//! 1. **Conformance injection**: a mapped unit declares its interface.
//! 2. **Return position**: mapped return types stay as they are; an instance
//!    of the concrete type already satisfies the interface after pass 1.
//! 3. **Parameter position**: direct mapped parameters are retyped to the
//!    interface with a cast back to the concrete type prepended to the body.
//!    Parameters with the mapped type one level inside an array, container
//!    or function get an adapting overload instead; anything deeper is left
//!    alone and reported.
//!
//! The rewriter only reports overload collisions. Whether a collision fails
//! the load is up to the caller. Rewriting is idempotent: conformance already
//! declared and overloads synthesized by an earlier pass are kept as they are.

mod report;

pub use report::{
    AmbiguousCollision, EntryReport, Limitation, LimitationKind, RewriteDirective, RewriteReport,
};

use sideload_bytecode::unit::{entry_flags, flags, VERSION};
use sideload_bytecode::{
    BytecodeWriter, ConstantPool, EntryPoint, ModuleUnit, Opcode, Signature, TypeRef,
};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::registry::InterfaceRegistry;

/// Errors raised while rewriting a unit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    /// Unit format version the rewriter does not understand
    #[error("Unsupported unit format version {0}")]
    UnsupportedVersion(u32),

    /// Parameter slots exceed the addressable local range
    #[error("Entry point {0} has too many parameters to adapt")]
    TooManyParameters(String),
}

/// A rewritten unit and what was done to it
#[derive(Debug, Clone)]
pub struct Rewritten {
    /// Unit ready to be defined
    pub unit: ModuleUnit,
    /// What changed
    pub report: RewriteReport,
}

/// Rewrite a unit against the registry
#[instrument(level = "debug", skip_all, fields(unit = %unit.name))]
pub fn rewrite(mut unit: ModuleUnit, registry: &InterfaceRegistry) -> Result<Rewritten, RewriteError> {
    if unit.version != VERSION {
        return Err(RewriteError::UnsupportedVersion(unit.version));
    }

    let mut report = RewriteReport {
        unit: unit.name.clone(),
        ..Default::default()
    };

    let mut changed = false;

    if let Some(interface) = registry.interface_name_for(&unit.name) {
        if !unit.declares(interface) {
            unit.capabilities.push(interface.to_string());
            report.injected = Some(interface.to_string());
            changed = true;
        }
    }

    // Instance (name, parameter list) pairs authored on the unit as it is
    // being rewritten; statics never compete with instance overloads
    let mut occupied: HashSet<OverloadKey> = unit
        .entry_points
        .iter()
        .filter(|e| !e.is_static() && !e.is_synthetic())
        .map(overload_key)
        .collect();
    // Overloads synthesized by an earlier pass
    let present: HashSet<OverloadKey> = unit
        .entry_points
        .iter()
        .filter(|e| !e.is_static() && e.is_synthetic())
        .map(overload_key)
        .collect();
    let mut superseded: HashSet<OverloadKey> = HashSet::new();

    let entries = std::mem::take(&mut unit.entry_points);
    let mut rewritten = Vec::with_capacity(entries.len());
    let mut synthesized = Vec::new();

    for mut entry in entries {
        let directive = RewriteDirective::classify(&entry.signature, entry.is_static(), registry);
        let signature = entry.signature.to_string();
        trace!(
            entry = %entry.name,
            signature = %signature,
            directive = directive.kind(),
            "classified entry point"
        );

        match &directive {
            RewriteDirective::NoOp | RewriteDirective::ReturnOnly => {
                if entry.is_static() && mentions_mapped(&entry.signature, registry) {
                    report.limitations.push(Limitation {
                        operation: entry.name.clone(),
                        signature: signature.clone(),
                        kind: LimitationKind::StaticUnadapted,
                    });
                }
            }
            RewriteDirective::ParameterRewrite { params } => {
                let adapted = adapt_params(&entry.signature, params, registry);
                let key = (entry.name.clone(), adapted.clone());
                if occupied.contains(&key) {
                    report.ambiguous.push(collision(&entry.name, &adapted, &entry.signature.ret));
                } else {
                    if present.contains(&key) {
                        superseded.insert(key.clone());
                    }
                    occupied.remove(&overload_key(&entry));
                    occupied.insert(key);
                    insert_casts(&mut entry, params, &mut unit.constants)?;
                    entry.signature.params = adapted;
                    changed = true;
                }
            }
            RewriteDirective::SynthesizeOverload { params } => {
                let adapted = adapt_params(&entry.signature, params, registry);
                let key = (entry.name.clone(), adapted.clone());
                if occupied.contains(&key) {
                    report.ambiguous.push(collision(&entry.name, &adapted, &entry.signature.ret));
                } else if present.contains(&key) {
                    trace!(entry = %entry.name, "adapting overload already present");
                } else {
                    occupied.insert(key);
                    let overload = synthesize_overload(&entry, params, adapted, &mut unit.constants)?;
                    report
                        .synthesized
                        .push(format!("{}{}", overload.name, overload.signature));
                    synthesized.push(overload);
                    changed = true;
                }
            }
            RewriteDirective::Unrewritable { .. } => {
                report.limitations.push(Limitation {
                    operation: entry.name.clone(),
                    signature: signature.clone(),
                    kind: LimitationKind::Unrewritable,
                });
            }
        }

        report.entries.push(EntryReport {
            name: entry.name.clone(),
            signature,
            directive,
        });
        rewritten.push(entry);
    }

    if !superseded.is_empty() {
        rewritten.retain(|e| !(e.is_synthetic() && superseded.contains(&overload_key(e))));
    }
    rewritten.extend(synthesized);
    unit.entry_points = rewritten;
    if changed {
        unit.flags |= flags::REWRITTEN;
    }

    debug!(
        changed,
        synthesized = report.synthesized.len(),
        ambiguous = report.ambiguous.len(),
        limitations = report.limitations.len(),
        "rewrote unit"
    );

    Ok(Rewritten { unit, report })
}

type OverloadKey = (String, Vec<TypeRef>);

fn overload_key(entry: &EntryPoint) -> OverloadKey {
    (entry.name.clone(), entry.signature.params.clone())
}

fn mentions_mapped(signature: &Signature, registry: &InterfaceRegistry) -> bool {
    signature
        .params
        .iter()
        .chain(std::iter::once(&signature.ret))
        .any(|ty| registry.mapped_depth(ty).is_some())
}

/// Parameter list with the listed parameters retyped to their interfaces
fn adapt_params(signature: &Signature, params: &[usize], registry: &InterfaceRegistry) -> Vec<TypeRef> {
    signature
        .params
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            if params.contains(&index) {
                registry.substitute(ty)
            } else {
                ty.clone()
            }
        })
        .collect()
}

fn collision(name: &str, params: &[TypeRef], ret: &TypeRef) -> AmbiguousCollision {
    AmbiguousCollision {
        operation: name.to_string(),
        signature: Signature::new(params.to_vec(), ret.clone()).to_string(),
    }
}

fn param_slot(entry: &EntryPoint, index: usize) -> Result<u16, RewriteError> {
    u16::try_from(entry.first_param_slot() + index)
        .map_err(|_| RewriteError::TooManyParameters(entry.name.clone()))
}

/// Prepend `LOAD_LOCAL k; CHECK_CAST <original>; STORE_LOCAL k` per parameter
///
/// Jump offsets are relative, so the original body needs no patching.
fn insert_casts(
    entry: &mut EntryPoint,
    params: &[usize],
    pool: &mut ConstantPool,
) -> Result<(), RewriteError> {
    let mut code = BytecodeWriter::new();
    for &index in params {
        let slot = param_slot(entry, index)?;
        let descriptor = pool.intern(&entry.signature.params[index].to_string());
        code.emit_load_local(slot);
        code.emit_check_cast(descriptor);
        code.emit_store_local(slot);
    }
    code.emit_bytes(&entry.code);
    entry.code = code.into_bytes();
    Ok(())
}

/// Overload taking interface-typed arguments that casts them back to the
/// original shapes and forwards to the original entry point
fn synthesize_overload(
    original: &EntryPoint,
    params: &[usize],
    adapted: Vec<TypeRef>,
    pool: &mut ConstantPool,
) -> Result<EntryPoint, RewriteError> {
    let arity = original.signature.arity();
    let argc =
        u16::try_from(arity).map_err(|_| RewriteError::TooManyParameters(original.name.clone()))?;

    let mut code = BytecodeWriter::new();
    code.emit_load_local(0);
    for index in 0..arity {
        code.emit_load_local(param_slot(original, index)?);
        if params.contains(&index) {
            let descriptor = pool.intern(&original.signature.params[index].to_string());
            code.emit_check_cast(descriptor);
        }
    }
    let name = pool.intern(&original.name);
    let signature = pool.intern(&original.signature.to_string());
    code.emit_call_exact(name, signature, argc);
    code.emit_opcode(Opcode::Return);

    Ok(EntryPoint {
        name: original.name.clone(),
        signature: Signature::new(adapted, original.signature.ret.clone()),
        flags: original.flags | entry_flags::SYNTHETIC,
        local_count: arity + 1,
        code: code.into_bytes(),
    })
}

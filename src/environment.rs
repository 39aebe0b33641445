use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use tracing::trace;

use crate::{
    diagnostics::{error_at, DiagnosticKind, KentError, Result, SourceSpan},
    ownership::{BorrowId, LedgerEntry, OwnershipState, Violation},
    value::Value,
};

pub type EnvironmentRef = Rc<RefCell<Environment>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// `let`: bound once, never reassigned.
    Immutable,
    /// `let mut`, parameters and loop bindings.
    Mutable,
    /// `const`: neither reassigned nor redeclared in the same frame.
    Constant,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub mutability: Mutability,
    pub ledger: LedgerEntry,
}

/// One lexical frame. Lookups walk outward through `parent`.
#[derive(Debug, Default)]
pub struct Environment {
    parent: Option<EnvironmentRef>,
    bindings: IndexMap<String, Binding>,
}

impl Environment {
    pub fn new() -> EnvironmentRef {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn with_parent(parent: EnvironmentRef) -> EnvironmentRef {
        Rc::new(RefCell::new(Self {
            parent: Some(parent),
            bindings: IndexMap::new(),
        }))
    }

    /// Installs a fresh, owned binding in this frame, replacing any previous one.
    pub fn define(&mut self, name: impl Into<String>, value: Value, mutability: Mutability) {
        self.bindings.insert(
            name.into(),
            Binding {
                value,
                mutability,
                ledger: LedgerEntry::default(),
            },
        );
    }

    /// Like [`Environment::define`], but refuses to shadow a constant
    /// declared in the same frame.
    pub fn declare(
        &mut self,
        name: &str,
        value: Value,
        mutability: Mutability,
        span: SourceSpan,
    ) -> Result<()> {
        if let Some(existing) = self.bindings.get(name) {
            if existing.mutability == Mutability::Constant {
                return Err(error_at(
                    DiagnosticKind::Immutable,
                    format!("cannot redeclare constant `{name}`"),
                    span,
                ));
            }
        }
        self.define(name, value, mutability);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.bindings
            .iter()
            .map(|(name, binding)| (name.as_str(), binding))
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// The frame in `env`'s chain that holds `name`, if any.
    pub fn frame_of(env: &EnvironmentRef, name: &str) -> Option<EnvironmentRef> {
        let mut current = Some(Rc::clone(env));
        while let Some(frame) = current {
            if frame.borrow().bindings.contains_key(name) {
                return Some(frame);
            }
            current = frame.borrow().parent.clone();
        }
        None
    }

    fn with_binding<T>(
        env: &EnvironmentRef,
        name: &str,
        span: SourceSpan,
        f: impl FnOnce(&mut Binding) -> Result<T>,
    ) -> Result<T> {
        let frame = Self::frame_of(env, name).ok_or_else(|| undefined(name, span))?;
        let mut frame = frame.borrow_mut();
        let binding = frame
            .bindings
            .get_mut(name)
            .ok_or_else(|| undefined(name, span))?;
        f(binding)
    }

    pub fn get(env: &EnvironmentRef, name: &str, span: SourceSpan) -> Result<Value> {
        Self::with_binding(env, name, span, |binding| {
            binding
                .ledger
                .check_read()
                .map_err(|v| violation(v, name, span))?;
            Ok(binding.value.clone())
        })
    }

    pub fn assign(env: &EnvironmentRef, name: &str, value: Value, span: SourceSpan) -> Result<()> {
        Self::with_binding(env, name, span, |binding| {
            ensure_mutable(binding, name, span)?;
            binding
                .ledger
                .check_write(None)
                .map_err(|v| violation(v, name, span))?;
            binding.value = value;
            Ok(())
        })
    }

    /// The value bound to `name` without any ownership checks.
    pub fn peek(env: &EnvironmentRef, name: &str) -> Option<Value> {
        let frame = Self::frame_of(env, name)?;
        let frame = frame.borrow();
        frame.bindings.get(name).map(|binding| binding.value.clone())
    }

    pub fn ownership_state(env: &EnvironmentRef, name: &str) -> Option<OwnershipState> {
        let frame = Self::frame_of(env, name)?;
        let frame = frame.borrow();
        frame.bindings.get(name).map(|binding| binding.ledger.state())
    }

    /// The value of `name` when it is bound as a `const`.
    pub fn constant(env: &EnvironmentRef, name: &str) -> Option<Value> {
        let frame = Self::frame_of(env, name)?;
        let frame = frame.borrow();
        frame
            .bindings
            .get(name)
            .filter(|binding| binding.mutability == Mutability::Constant)
            .map(|binding| binding.value.clone())
    }

    /// Fails unless the value behind `name` may be mutated in place, e.g. by
    /// a field write. Mutability of the binding itself is not required.
    pub fn check_mutation(env: &EnvironmentRef, name: &str, span: SourceSpan) -> Result<()> {
        Self::with_binding(env, name, span, |binding| {
            binding
                .ledger
                .check_write(None)
                .map_err(|v| violation(v, name, span))
        })
    }

    /// Like [`Environment::check_mutation`], for a write made through the
    /// borrow `id` of `name` in `frame`.
    pub fn check_write_through(
        frame: &EnvironmentRef,
        name: &str,
        id: BorrowId,
        span: SourceSpan,
    ) -> Result<()> {
        Self::with_binding(frame, name, span, |binding| {
            binding
                .ledger
                .check_write(Some(id))
                .map_err(|v| violation(v, name, span))
        })
    }

    /// `move source to target`. A `target` already bound somewhere in the
    /// chain is overwritten in its own frame; otherwise it is defined in
    /// `env`. Both ends are validated before anything changes.
    pub fn move_binding(
        env: &EnvironmentRef,
        source: &str,
        target: &str,
        span: SourceSpan,
    ) -> Result<()> {
        Self::with_binding(env, source, span, |binding| {
            binding
                .ledger
                .check_move()
                .map_err(|v| violation(v, source, span))
        })?;
        if source == target {
            return Ok(());
        }
        let destination = Self::frame_of(env, target);
        if let Some(frame) = &destination {
            Self::with_binding(frame, target, span, |binding| {
                ensure_mutable(binding, target, span)?;
                binding
                    .ledger
                    .check_replace()
                    .map_err(|v| violation(v, target, span))
            })?;
        }
        let (value, mutability) = Self::take_for_move(env, source, span)?;
        match destination {
            Some(frame) => Self::with_binding(&frame, target, span, |binding| {
                binding.value = value;
                binding.ledger = LedgerEntry::default();
                Ok(())
            }),
            None => {
                env.borrow_mut().define(target, value, mutability);
                Ok(())
            }
        }
    }

    /// Marks `name` as moved and hands back its value and mutability.
    fn take_for_move(
        env: &EnvironmentRef,
        name: &str,
        span: SourceSpan,
    ) -> Result<(Value, Mutability)> {
        Self::with_binding(env, name, span, |binding| {
            binding
                .ledger
                .mark_moved()
                .map_err(|v| violation(v, name, span))?;
            trace!(binding = name, "moved");
            let value = std::mem::replace(&mut binding.value, Value::null());
            let mutability = match binding.mutability {
                Mutability::Constant => Mutability::Immutable,
                other => other,
            };
            Ok((value, mutability))
        })
    }

    /// Opens a borrow on `name` and returns the frame that owns it.
    pub fn open_borrow(
        env: &EnvironmentRef,
        name: &str,
        id: BorrowId,
        exclusive: bool,
        span: SourceSpan,
    ) -> Result<EnvironmentRef> {
        let frame = Self::frame_of(env, name).ok_or_else(|| undefined(name, span))?;
        Self::with_binding(&frame, name, span, |binding| {
            let result = if exclusive {
                binding.ledger.borrow_exclusive(id)
            } else {
                binding.ledger.borrow_shared(id)
            };
            result.map_err(|v| violation(v, name, span))?;
            trace!(binding = name, id, state = %binding.ledger.state(), "borrowed");
            Ok(())
        })?;
        Ok(frame)
    }

    pub fn release(
        env: &EnvironmentRef,
        name: &str,
        id: Option<BorrowId>,
        span: SourceSpan,
    ) -> Result<()> {
        Self::with_binding(env, name, span, |binding| {
            binding
                .ledger
                .release(id)
                .map_err(|v| violation(v, name, span))?;
            trace!(binding = name, state = %binding.ledger.state(), "released");
            Ok(())
        })
    }

    /// Reads `name` through the open borrow `id`.
    pub fn read_through(
        frame: &EnvironmentRef,
        name: &str,
        id: BorrowId,
        span: SourceSpan,
    ) -> Result<Value> {
        Self::with_binding(frame, name, span, |binding| {
            if !binding.ledger.is_open(id) {
                return Err(violation(Violation::HandleReleased, name, span));
            }
            Ok(binding.value.clone())
        })
    }

    /// Writes `name` through the exclusive borrow `id`.
    pub fn write_through(
        frame: &EnvironmentRef,
        name: &str,
        id: BorrowId,
        value: Value,
        span: SourceSpan,
    ) -> Result<()> {
        Self::with_binding(frame, name, span, |binding| {
            ensure_mutable(binding, name, span)?;
            binding
                .ledger
                .check_write(Some(id))
                .map_err(|v| violation(v, name, span))?;
            binding.value = value;
            Ok(())
        })
    }
}

fn ensure_mutable(binding: &Binding, name: &str, span: SourceSpan) -> Result<()> {
    let message = match binding.mutability {
        Mutability::Mutable => return Ok(()),
        Mutability::Immutable => format!("cannot assign to immutable binding `{name}`"),
        Mutability::Constant => format!("cannot assign to constant `{name}`"),
    };
    Err(error_at(DiagnosticKind::Immutable, message, span))
}

fn undefined(name: &str, span: SourceSpan) -> KentError {
    error_at(
        DiagnosticKind::Name,
        format!("undefined variable `{name}`"),
        span,
    )
}

fn violation(violation: Violation, name: &str, span: SourceSpan) -> KentError {
    error_at(DiagnosticKind::Ownership, violation.message(name), span)
}

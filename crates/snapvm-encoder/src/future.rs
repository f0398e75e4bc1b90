// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2026 Pegasus Heavy Industries, LLC

//! Deferred value cells.
//!
//! A [`Future`] is a single-assignment-with-retraction cell: a scalar that
//! will be computed later (typically "the address of block B"), observable by
//! any number of downstream consumers. Unlike an async future this is a
//! same-thread dependency-graph device: resolution fires registered
//! observers synchronously, and a cell may be resolved, unresolved, and
//! re-resolved arbitrarily many times while layout passes refine their
//! estimates. Only at finalization time must every cell be resolved for good.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// A value that is either available now or will arrive through a [`Future`].
#[derive(Clone)]
pub enum Lazy<T: Clone + 'static> {
    /// The value is already known.
    Now(T),
    /// The value will be supplied by the cell later.
    Later(Future<T>),
}

impl<T: Clone + 'static> Lazy<T> {
    /// Returns the value if it is available at this moment.
    pub fn try_get(&self) -> Option<T> {
        match self {
            Lazy::Now(v) => Some(v.clone()),
            Lazy::Later(f) => f.try_get(),
        }
    }
}

impl From<i64> for Lazy<i64> {
    fn from(v: i64) -> Self {
        Lazy::Now(v)
    }
}

impl<T: Clone + 'static> From<Future<T>> for Lazy<T> {
    fn from(f: Future<T>) -> Self {
        Lazy::Later(f)
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lazy::Now(v) => write!(f, "Lazy::Now({:?})", v),
            Lazy::Later(fut) => write!(f, "Lazy::Later({:?})", fut),
        }
    }
}

struct Observer<T> {
    id: u64,
    on_resolve: Box<dyn FnMut(&T)>,
    on_unresolve: Box<dyn FnMut()>,
}

struct Inner<T> {
    value: Option<T>,
    /// Set once `assign` has bound this cell; a second `assign` is a bug.
    assigned: bool,
    observers: Vec<Observer<T>>,
    next_id: u64,
}

/// A deferred value cell with reactive derivation.
///
/// Handles are cheap clones of a shared cell. The cell is written by its
/// owner through [`resolve`](Future::resolve) / [`unresolve`](Future::unresolve)
/// or a one-time [`assign`](Future::assign), and read by any holder once
/// resolved.
pub struct Future<T: Clone + 'static>(Rc<RefCell<Inner<T>>>);

impl<T: Clone + 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future(Rc::clone(&self.0))
    }
}

impl<T: Clone + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Future<T> {
    /// Creates an unresolved cell.
    pub fn new() -> Self {
        Future(Rc::new(RefCell::new(Inner {
            value: None,
            assigned: false,
            observers: Vec::new(),
            next_id: 0,
        })))
    }

    /// Creates a cell that is already resolved to `value`.
    pub fn of(value: T) -> Self {
        let f = Self::new();
        f.resolve(value);
        f
    }

    /// True once the cell carries a value.
    pub fn is_resolved(&self) -> bool {
        self.0.borrow().value.is_some()
    }

    /// Returns the value if resolved.
    pub fn try_get(&self) -> Option<T> {
        self.0.borrow().value.clone()
    }

    /// Returns the value.
    ///
    /// # Panics
    ///
    /// Panics if the cell is unresolved; reading an address before layout
    /// has produced it is an encoder bug, never a recoverable condition.
    pub fn get(&self) -> T {
        self.try_get()
            .unwrap_or_else(|| panic!("deferred value read before resolution"))
    }

    /// Sets the value and notifies resolve observers.
    ///
    /// If the cell is already resolved it is unresolved first, so observers
    /// always see a clean generation: every resolve is preceded by exactly
    /// one matching unresolve.
    pub fn resolve(&self, value: T) {
        if self.is_resolved() {
            self.unresolve();
        }
        self.0.borrow_mut().value = Some(value.clone());
        self.notify_resolve(&value);
    }

    /// Clears the value and notifies unresolve observers. No-op when already
    /// unresolved.
    pub fn unresolve(&self) {
        if self.0.borrow_mut().value.take().is_none() {
            return;
        }
        self.notify_unresolve();
    }

    /// Permanently binds this cell to a constant or to another cell, whose
    /// resolve/unresolve events it then mirrors.
    ///
    /// # Panics
    ///
    /// Panics if the cell was already assigned or already resolved directly;
    /// a cell has exactly one owner.
    pub fn assign(&self, source: impl Into<Lazy<T>>) {
        {
            let inner = self.0.borrow();
            assert!(!inner.assigned, "deferred cell assigned twice");
            assert!(
                inner.value.is_none(),
                "deferred cell assigned after direct resolution"
            );
        }
        self.0.borrow_mut().assigned = true;
        match source.into() {
            Lazy::Now(v) => self.resolve(v),
            Lazy::Later(src) => {
                let out = self.clone();
                let out2 = self.clone();
                // The chain lives as long as the source cell.
                let _ = src.subscribe(
                    move |v: &T| out.resolve(v.clone()),
                    move || out2.unresolve(),
                );
                if let Some(v) = src.try_get() {
                    self.resolve(v);
                }
            }
        }
    }

    /// Registers a pair of observers fired on every resolve and unresolve.
    ///
    /// The observer does not fire for the current state; callers that need an
    /// initial sync read [`try_get`](Future::try_get) themselves. The
    /// returned [`Subscription`] must be cancelled explicitly to detach.
    pub fn subscribe(
        &self,
        on_resolve: impl FnMut(&T) + 'static,
        on_unresolve: impl FnMut() + 'static,
    ) -> Subscription<T> {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push(Observer {
            id,
            on_resolve: Box::new(on_resolve),
            on_unresolve: Box::new(on_unresolve),
        });
        Subscription {
            cell: Rc::downgrade(&self.0),
            id,
        }
    }

    /// Returns a derived cell holding `f(value)`, re-fired on every resolve
    /// and unresolve of this cell.
    pub fn map<U: Clone + 'static>(&self, f: impl Fn(&T) -> U + 'static) -> Future<U> {
        let out = Future::new();
        let o1 = out.clone();
        let o2 = out.clone();
        let f = Rc::new(f);
        let f1 = Rc::clone(&f);
        let _ = self.subscribe(move |v: &T| o1.resolve(f1(v)), move || o2.unresolve());
        if let Some(v) = self.try_get() {
            out.resolve(f(&v));
        }
        out
    }

    /// Chains through an intermediate cell: whenever this cell resolves, `f`
    /// produces an inner cell whose value is forwarded to the result.
    ///
    /// Handles the source and the inner cell each resolving and unresolving
    /// any number of times: a new generation of the source detaches the
    /// previous inner subscription before attaching the next.
    pub fn bind<U: Clone + 'static>(&self, f: impl Fn(&T) -> Future<U> + 'static) -> Future<U> {
        let out = Future::new();
        let inner_sub: Rc<RefCell<Option<Subscription<U>>>> = Rc::new(RefCell::new(None));

        let attach = {
            let out = out.clone();
            let inner_sub = Rc::clone(&inner_sub);
            let f = Rc::new(f);
            Rc::new(move |v: &T| {
                if let Some(prev) = inner_sub.borrow_mut().take() {
                    prev.cancel();
                }
                let inner = f(v);
                let o1 = out.clone();
                let o2 = out.clone();
                let sub = inner.subscribe(
                    move |u: &U| o1.resolve(u.clone()),
                    move || o2.unresolve(),
                );
                *inner_sub.borrow_mut() = Some(sub);
                match inner.try_get() {
                    Some(u) => out.resolve(u),
                    None => out.unresolve(),
                }
            })
        };

        let attach2 = Rc::clone(&attach);
        let detach_out = out.clone();
        let detach_sub = Rc::clone(&inner_sub);
        let _ = self.subscribe(
            move |v: &T| attach2(v),
            move || {
                if let Some(prev) = detach_sub.borrow_mut().take() {
                    prev.cancel();
                }
                detach_out.unresolve();
            },
        );
        if let Some(v) = self.try_get() {
            attach(&v);
        }
        out
    }

    fn notify_resolve(&self, value: &T) {
        // Observers are moved out while firing so a callback may subscribe
        // to this same cell without re-entering the borrow.
        let mut observers = std::mem::take(&mut self.0.borrow_mut().observers);
        for obs in observers.iter_mut() {
            (obs.on_resolve)(value);
        }
        let mut inner = self.0.borrow_mut();
        observers.extend(inner.observers.drain(..));
        inner.observers = observers;
    }

    fn notify_unresolve(&self) {
        let mut observers = std::mem::take(&mut self.0.borrow_mut().observers);
        for obs in observers.iter_mut() {
            (obs.on_unresolve)();
        }
        let mut inner = self.0.borrow_mut();
        observers.extend(inner.observers.drain(..));
        inner.observers = observers;
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_get() {
            Some(v) => write!(f, "Future(resolved: {:?})", v),
            None => write!(f, "Future(unresolved)"),
        }
    }
}

/// A registered observer pair that can be detached.
pub struct Subscription<T: Clone + 'static> {
    cell: Weak<RefCell<Inner<T>>>,
    id: u64,
}

impl<T: Clone + 'static> Subscription<T> {
    /// Detaches the observers. No-op if the cell is gone.
    pub fn cancel(self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.borrow_mut().observers.retain(|o| o.id != self.id);
        }
    }
}

//! The run-time environment: a chain of frames storing variable values.
//!
//! Frames are shared: closures capture the environment current at the
//! time the `pec` instruction runs, so a frame stays alive for as long
//! as any closure (or the machine itself) can still reach it.  Variables
//! are addressed by the `(back, over)` lexical addresses produced by the
//! compiler; an address is valid for every program point at which the
//! compile-time environment assigned it.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

struct Frame {
    vars: RefCell<Vec<Value>>,
    up: Option<Env>,
}

/// A handle to the innermost frame of a run-time environment.  Cloning
/// is cheap and shares the frames.
#[derive(Clone)]
pub struct Env {
    frame: Rc<Frame>,
}

impl Env {
    /// Create an environment with a single, empty top-level frame.
    ///
    /// `hint` is the expected number of variables, 0 when unknown.
    pub fn new(hint: usize) -> Env {
        Env {
            frame: Rc::new(Frame {
                vars: RefCell::new(Vec::with_capacity(hint)),
                up: None,
            }),
        }
    }

    /// Push a new empty frame and return the extended environment.
    pub fn push_frame(&self, hint: usize) -> Env {
        Env {
            frame: Rc::new(Frame {
                vars: RefCell::new(Vec::with_capacity(hint)),
                up: Some(self.clone()),
            }),
        }
    }

    /// Pop the innermost frame.
    ///
    /// # Panics
    /// Panics when called on the top-level frame.
    pub fn pop_frame(&self) -> Env {
        self.frame.up.clone().expect("popped the top-level frame")
    }

    /// Append a new variable to the innermost frame.
    pub fn register(&self, val: Value) {
        self.frame.vars.borrow_mut().push(val);
    }

    fn back(&self, back: usize) -> &Frame {
        let mut frame = &self.frame;
        for _ in 0..back {
            frame = &frame
                .up
                .as_ref()
                .expect("lexical address escapes the environment")
                .frame;
        }
        frame
    }

    /// The value of the variable at `(back, over)`, or null when the
    /// slot has not been registered.
    pub fn lookup(&self, back: usize, over: usize) -> Value {
        self.back(back)
            .vars
            .borrow()
            .get(over)
            .copied()
            .unwrap_or(Value::Null)
    }

    /// Overwrite the variable at `(back, over)`.
    pub fn set_var(&self, back: usize, over: usize, val: Value) {
        let frame = self.back(back);
        let mut vars = frame.vars.borrow_mut();
        if over >= vars.len() {
            vars.resize(over + 1, Value::Null);
        }
        vars[over] = val;
    }

    /// True when the environment consists of the top-level frame only.
    pub fn is_toplevel(&self) -> bool {
        self.frame.up.is_none()
    }

    /// Number of variables registered in the innermost frame.
    pub fn num_vars(&self) -> usize {
        self.frame.vars.borrow().len()
    }

    /// Drop variables registered past `len` in the innermost frame.
    /// The incremental compiler uses this to roll the top-level frame
    /// back when an input fails after registering variables.
    pub fn truncate(&self, len: usize) {
        let mut vars = self.frame.vars.borrow_mut();
        if vars.len() > len {
            vars.truncate(len);
        }
    }

    /// Visit every value reachable from the environment.  Used as a GC
    /// root enumerator.
    pub fn for_each_value<F: FnMut(Value)>(&self, mut f: F) {
        let mut frame = Some(&self.frame);
        while let Some(fr) = frame {
            for val in fr.vars.borrow().iter() {
                f(*val);
            }
            frame = fr.up.as_ref().map(|e| &e.frame);
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut depth = 0;
        let mut frame = &self.frame;
        while let Some(up) = &frame.up {
            depth += 1;
            frame = &up.frame;
        }
        f.debug_struct("Env")
            .field("depth", &depth)
            .field("innermost_vars", &self.frame.vars.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_int;

    #[test]
    fn register_then_lookup() {
        let env = Env::new(0);
        env.register(make_int(10, 32));
        env.register(make_int(20, 32));
        assert_eq!(env.lookup(0, 1).to_raw(), make_int(20, 32).to_raw());
    }

    #[test]
    fn back_walks_frames() {
        let top = Env::new(0);
        top.register(make_int(1, 32));
        let inner = top.push_frame(0);
        inner.register(make_int(2, 32));
        assert_eq!(inner.lookup(1, 0).to_raw(), make_int(1, 32).to_raw());
        assert_eq!(inner.lookup(0, 0).to_raw(), make_int(2, 32).to_raw());
        let popped = inner.pop_frame();
        assert!(popped.is_toplevel());
    }

    #[test]
    fn set_var_overwrites() {
        let env = Env::new(0);
        env.register(make_int(1, 32));
        env.set_var(0, 0, make_int(9, 32));
        assert_eq!(env.lookup(0, 0).to_raw(), make_int(9, 32).to_raw());
    }
}

//! Training/inference mode and graph-recording switches.
//!
//! Both flags are thread-local and only change through guards, which put
//! the previous value back when dropped:
//!
//! ```
//! use ad_tensor::mode::{self, Mode};
//!
//! assert_eq!(mode::current(), Mode::Train);
//! {
//!     let _eval = mode::test_mode();
//!     assert_eq!(mode::current(), Mode::Inference);
//! }
//! assert_eq!(mode::current(), Mode::Train);
//! ```

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::trace;

/// Whether stateful functions such as batch normalization use batch
/// statistics (and update running averages) or stored running averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Inference,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

#[derive(Debug, Clone, Copy)]
struct Config {
    mode: Mode,
    enable_backprop: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Train,
            enable_backprop: true,
        }
    }
}

thread_local! {
    static CONFIG: Cell<Config> = Cell::new(Config::default());
}

/// The mode in effect on this thread.
pub fn current() -> Mode {
    CONFIG.with(|c| c.get().mode)
}

/// Whether `apply` records graph nodes on this thread.
pub fn is_backprop_enabled() -> bool {
    CONFIG.with(|c| c.get().enable_backprop)
}

/// Restores the previous configuration when dropped.
///
/// Guards are tied to the thread that created them.
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ConfigGuard {
    previous: Config,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CONFIG.with(|c| c.set(previous));
        trace!(mode = ?previous.mode, backprop = previous.enable_backprop, "config restored");
    }
}

fn enter(update: impl FnOnce(&mut Config)) -> ConfigGuard {
    let previous = CONFIG.with(|c| {
        let previous = c.get();
        let mut next = previous;
        update(&mut next);
        c.set(next);
        trace!(mode = ?next.mode, backprop = next.enable_backprop, "config entered");
        previous
    });
    ConfigGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Switch to `mode` until the guard is dropped.
pub fn using_mode(mode: Mode) -> ConfigGuard {
    enter(|c| c.mode = mode)
}

/// Shorthand for `using_mode(Mode::Inference)`.
pub fn test_mode() -> ConfigGuard {
    using_mode(Mode::Inference)
}

/// Stop recording graph nodes until the guard is dropped.
pub fn no_grad() -> ConfigGuard {
    enter(|c| c.enable_backprop = false)
}

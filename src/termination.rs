//! Defines the [`Termination`] trait.

use std::{convert::Infallible, fmt::Debug, process};

/// Extends [`std::process::Termination`] with a success check.
///
/// The application closure handed to [`gui::run`] runs on a secondary thread while the main thread
/// stays in the window event loop, which never returns. The process is therefore exited from that
/// thread, with an exit code derived from the [`Termination`] value:
///
/// - `0` if [`Termination::is_success`] returns `true`,
/// - `1` otherwise, after [`std::process::Termination::report`] has printed the error,
/// - `101` if the closure panicked.
///
/// [`gui::run`]: crate::gui::run
pub trait Termination: process::Termination {
    fn is_success(&self) -> bool;
}

impl Termination for Infallible {
    fn is_success(&self) -> bool {
        match *self {}
    }
}

impl Termination for () {
    fn is_success(&self) -> bool {
        true
    }
}

impl<T: Termination, E: Debug> Termination for Result<T, E> {
    fn is_success(&self) -> bool {
        match self {
            Ok(term) => term.is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success() {
        assert!(().is_success());
        assert!(Ok::<(), anyhow::Error>(()).is_success());
        assert!(!Err::<(), _>(anyhow::anyhow!("model not found")).is_success());
    }
}

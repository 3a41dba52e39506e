//! Feature-gated failpoint injection for crash testing.
//!
//! Compile with `--features failpoints` to enable injection. Without the
//! feature, the `fp!()` macro expands to `Ok(())`.
//!
//! Named points used by the engine:
//! - `FP_APPLY_AFTER_REMOVALS`: after existing paths are moved out of the way.
//! - `FP_APPLY_AFTER_INSERTIONS`: after new content is moved into place.
//! - `FP_MOVER_RENAME`: before every rename performed by the file mover.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

/// Actions a failpoint can take when triggered.
#[derive(Clone, Debug)]
pub enum FailpointAction {
    Off,
    /// Return an error with the given message.
    Error(String),
    /// Return an error the `n`th time the point is reached (1-based), then
    /// turn off.
    ErrorOnHit(usize, String),
    Panic(String),
}

static REGISTRY: LazyLock<Mutex<HashMap<&'static str, (FailpointAction, usize)>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Set a failpoint action.
pub fn set(name: &'static str, action: FailpointAction) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, (action, 0));
}

/// Clear a specific failpoint.
pub fn clear(name: &'static str) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
}

/// Clear all failpoints.
pub fn clear_all() {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Check if a failpoint is set and execute its action.
///
/// # Errors
/// Returns the configured message if the point fires.
///
/// # Panics
/// Panics if the failpoint action is `Panic`.
pub fn check(name: &str) -> Result<(), String> {
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    let Some((action, hits)) = registry.get_mut(name) else {
        return Ok(());
    };
    *hits += 1;
    match action {
        FailpointAction::Off => Ok(()),
        FailpointAction::Error(msg) => Err(msg.clone()),
        FailpointAction::ErrorOnHit(n, msg) => {
            if *hits == *n {
                let msg = msg.clone();
                *action = FailpointAction::Off;
                Err(msg)
            } else {
                Ok(())
            }
        }
        FailpointAction::Panic(msg) => panic!("failpoint {name}: {msg}"),
    }
}

/// Failpoint injection point.
///
/// Usage: `fp!("FP_APPLY_AFTER_REMOVALS")?;`
#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        $crate::failpoints::check($name).map_err(|message| {
            $crate::error::TransformError::Failpoint {
                name: ($name).to_owned(),
                message,
            }
        })
    };
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        Ok::<(), $crate::error::TransformError>(())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp_noop_when_not_set() {
        clear("FP_TEST_NOOP");
        assert!(fp!("FP_TEST_NOOP").is_ok());
    }

    #[test]
    #[cfg(feature = "failpoints")]
    fn fp_returns_error_when_set() {
        set("FP_TEST_ERROR", FailpointAction::Error("injected".into()));
        let err = fp!("FP_TEST_ERROR").unwrap_err();
        assert!(err.to_string().contains("injected"), "{err}");
        clear("FP_TEST_ERROR");
    }

    #[test]
    #[cfg(feature = "failpoints")]
    fn error_on_hit_fires_once() {
        set("FP_TEST_NTH", FailpointAction::ErrorOnHit(2, "second".into()));
        assert!(fp!("FP_TEST_NTH").is_ok());
        assert!(fp!("FP_TEST_NTH").is_err());
        assert!(fp!("FP_TEST_NTH").is_ok());
        clear("FP_TEST_NTH");
    }

    #[test]
    fn check_counts_without_firing_when_off() {
        set("FP_TEST_OFF", FailpointAction::Off);
        assert!(check("FP_TEST_OFF").is_ok());
        clear("FP_TEST_OFF");
    }
}

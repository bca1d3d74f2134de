//! Cooperative interrupt handling.
//!
//! SIGINT, SIGTERM and SIGHUP only raise a flag. The orchestrator polls it
//! between stages and while waiting on collaborator processes, then unwinds
//! normally so every scoped guard (swap, run lock, temp files) is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};

static HANDLER_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Shared interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag not connected to any signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process signal handler and return the flag it raises.
    ///
    /// Calling this more than once returns the same flag.
    pub fn install() -> Result<Self> {
        if let Some(flag) = HANDLER_FLAG.get() {
            return Ok(Self { flag: flag.clone() });
        }
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = flag.clone();
        ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::SeqCst);
        })
        .context("installing interrupt handler")?;
        let flag = HANDLER_FLAG.get_or_init(|| flag);

        Ok(Self { flag: flag.clone() })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

//! Exponential moving average of the network weights.
//!
//! The shadow copy is created lazily by the epoch driver, blended after
//! every gradient-applying step, swapped into the live parameters at epoch
//! end and swapped back out at the start of the next training epoch.

use candle_core::{bail, Result, Tensor, Var};

#[derive(Debug, Default)]
pub struct EmaState {
    shadow: Option<Vec<Tensor>>,
    restore: Option<Vec<Tensor>>,
}

impl EmaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn has_pending_restore(&self) -> bool {
        self.restore.is_some()
    }

    pub fn shadow(&self) -> Option<&[Tensor]> {
        self.shadow.as_deref()
    }

    /// Snapshots the live parameters as the initial shadow.
    pub fn initialize(&mut self, params: &[Var]) -> Result<()> {
        self.shadow = Some(snapshot_all(params)?);
        Ok(())
    }

    /// `shadow = shadow * (1 - decay) + live * decay`.
    pub fn step(&mut self, params: &[Var], decay: f64) -> Result<()> {
        let Some(shadow) = self.shadow.as_mut() else {
            return Ok(());
        };
        check_len(shadow.len(), params.len())?;
        for (slot, var) in shadow.iter_mut().zip(params) {
            let live = var.as_tensor().detach();
            *slot = (slot.affine(1.0 - decay, 0.0)? + live.affine(decay, 0.0)?)?;
        }
        Ok(())
    }

    /// Writes the shadow into the live parameters, keeping the previous
    /// values for `restore`.
    pub fn apply(&mut self, params: &[Var]) -> Result<()> {
        let Some(shadow) = self.shadow.as_ref() else {
            return Ok(());
        };
        check_len(shadow.len(), params.len())?;

        if self.restore.is_some() {
            log::warn!("ema already applied; keeping the original restore buffer");
        } else {
            self.restore = Some(snapshot_all(params)?);
        }

        log::info!("applying ema");
        for (var, value) in params.iter().zip(shadow) {
            var.set(value)?;
        }
        Ok(())
    }

    /// Puts back the parameters saved by `apply` and drops the buffer.
    pub fn restore(&mut self, params: &[Var]) -> Result<()> {
        let Some(saved) = self.restore.take() else {
            return Ok(());
        };
        check_len(saved.len(), params.len())?;

        log::info!("restoring params from before ema");
        for (var, value) in params.iter().zip(&saved) {
            var.set(value)?;
        }
        Ok(())
    }

    /// Drops the shadow. A pending restore buffer is kept.
    pub fn clear(&mut self) {
        self.shadow = None;
    }
}

fn snapshot_all(params: &[Var]) -> Result<Vec<Tensor>> {
    params.iter().map(|var| var.as_tensor().detach().copy()).collect()
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        bail!("ema tracks {expected} parameters but the network has {actual}");
    }
    Ok(())
}

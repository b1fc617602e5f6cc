//! Reference-counted power control of a UVC endpoint.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::backend::{ExtensionUnit, PowerState, UvcDevice};
use crate::Result;

/// Shared power bookkeeping for one UVC device.
///
/// The device is powered iff `users > 0`. The count and the hardware
/// transition change together under the power lock, independent of any
/// stream configuration lock.
pub struct PowerController {
    device: Arc<dyn UvcDevice>,
    users: Mutex<usize>,
    xus: Mutex<Vec<ExtensionUnit>>,
}

impl PowerController {
    pub fn new(device: Arc<dyn UvcDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            users: Mutex::new(0),
            xus: Mutex::new(Vec::new()),
        })
    }

    /// Extension units initialised on every power-up.
    pub fn register_xu(&self, xu: ExtensionUnit) {
        self.xus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(xu);
    }

    pub fn has_xu(&self, xu: &ExtensionUnit) -> bool {
        self.xus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(xu)
    }

    pub fn users(&self) -> usize {
        *self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_powered(&self) -> bool {
        self.users() > 0
    }

    fn power_up(&self) -> Result<()> {
        self.device.set_power_state(PowerState::D0)?;
        let xus = self
            .xus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for xu in &xus {
            if let Err(e) = self.device.init_xu(xu) {
                log::warn!("Extension unit {} init failed, powering down: {}", xu.unit, e);
                if let Err(e) = self.device.set_power_state(PowerState::D3) {
                    log::warn!("Power down after failed init failed: {}", e);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn acquire(&self) -> Result<()> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if *users == 0 {
            self.power_up()?;
            log::info!("UVC device powered on");
        }
        *users += 1;
        Ok(())
    }

    fn release(&self) {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        match *users {
            0 => log::warn!("Power release without a matching acquire"),
            1 => {
                if let Err(e) = self.device.set_power_state(PowerState::D3) {
                    log::warn!("Failed to power off UVC device: {}", e);
                } else {
                    log::info!("UVC device powered off");
                }
                *users = 0;
            }
            _ => *users -= 1,
        }
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        let users = *self.users.get_mut().unwrap_or_else(PoisonError::into_inner);
        if users > 0 {
            log::warn!("Power controller dropped with {} users, powering off", users);
            if let Err(e) = self.device.set_power_state(PowerState::D3) {
                log::warn!("Failed to power off UVC device: {}", e);
            }
        }
    }
}

/// Scoped power reference; released exactly once on drop.
///
/// Holds only a weak reference to its controller, so a guard stored inside
/// the owning sensor never keeps that sensor alive.
#[must_use = "power is released as soon as the guard is dropped"]
pub struct PowerGuard {
    owner: Weak<PowerController>,
}

impl PowerGuard {
    /// Power the device if needed. On failure the count is unchanged.
    pub fn acquire(owner: &Arc<PowerController>) -> Result<Self> {
        owner.acquire()?;
        Ok(Self {
            owner: Arc::downgrade(owner),
        })
    }
}

impl Drop for PowerGuard {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release();
        }
    }
}

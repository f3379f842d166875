//! Per-thread runtime defaults.
//!
//! Creation helpers read the default device and dtype from here; the convolution
//! family reads its execution-strategy hints and the gates of its fast paths.

use crate::{device::Device, dtype::DType};
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub device: Device,
    pub dtype: DType,
    /// Allows the accelerated-library convolution path when an engine is registered.
    pub accelerated_enabled: bool,
    /// Allows the specialised depthwise convolution kernels.
    pub depthwise_enabled: bool,
    pub deterministic: bool,
    pub benchmark: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::CPU,
            dtype: DType::F32,
            accelerated_enabled: true,
            depthwise_enabled: true,
            deterministic: false,
            benchmark: false,
        }
    }
}

thread_local! {
    static CONFIG: Cell<Config> = Cell::new(Config::default());
}

pub fn get_config() -> Config {
    CONFIG.with(|c| c.get())
}

pub fn set_config(config: Config) {
    CONFIG.with(|c| c.set(config));
}

fn update(f: impl FnOnce(&mut Config)) {
    CONFIG.with(|c| {
        let mut config = c.get();
        f(&mut config);
        c.set(config);
    });
}

pub fn get_default_device() -> Device {
    get_config().device
}

pub fn set_default_device(device: Device) {
    update(|c| c.device = device);
}

pub fn get_default_dtype() -> DType {
    get_config().dtype
}

pub fn set_default_dtype(dtype: DType) {
    update(|c| c.dtype = dtype);
}

pub fn is_accelerated_enabled() -> bool {
    get_config().accelerated_enabled
}

pub fn set_accelerated_enabled(enabled: bool) {
    update(|c| c.accelerated_enabled = enabled);
}

pub fn is_depthwise_enabled() -> bool {
    get_config().depthwise_enabled
}

pub fn set_depthwise_enabled(enabled: bool) {
    update(|c| c.depthwise_enabled = enabled);
}

pub fn is_deterministic() -> bool {
    get_config().deterministic
}

pub fn set_deterministic(deterministic: bool) {
    update(|c| c.deterministic = deterministic);
}

pub fn is_benchmark() -> bool {
    get_config().benchmark
}

pub fn set_benchmark(benchmark: bool) {
    update(|c| c.benchmark = benchmark);
}

/// Restores the configuration that was active when the guard was created.
pub struct ConfigGuard {
    prev: Config,
}

impl ConfigGuard {
    pub fn new(config: Config) -> Self {
        let prev = get_config();
        set_config(config);
        Self { prev }
    }

    /// Applies `f` to a copy of the current configuration and installs the result.
    pub fn with(f: impl FnOnce(&mut Config)) -> Self {
        let mut config = get_config();
        f(&mut config);
        Self::new(config)
    }
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        set_config(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_config() {
        let before = get_config();
        {
            let _guard = ConfigGuard::with(|c| {
                c.depthwise_enabled = false;
                c.dtype = DType::F64;
            });
            assert!(!is_depthwise_enabled());
            assert_eq!(get_default_dtype(), DType::F64);
        }
        assert_eq!(get_config(), before);
    }
}

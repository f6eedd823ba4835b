#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate cfg_if;
extern crate crossbeam_utils;

pub mod config;
pub mod ds_impl;

pub use ds_impl::{ConcurrentSet, FRList, Key, LockList};

cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        extern crate tikv_jemalloc_ctl;
        pub struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }
        impl MemSampler {
            pub fn new() -> Self {
                MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib().unwrap(),
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib().unwrap(),
                }
            }
            pub fn sample(&self) -> usize {
                self.epoch_mib.advance().unwrap();
                self.allocated_mib.read().unwrap()
            }
        }
    } else {
        pub struct MemSampler {}
        impl MemSampler {
            pub fn new() -> Self {
                log::warn!("memory usage sampling is supported only on linux");
                MemSampler {}
            }
            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}

use crate::vm::Vm;
use vzhal::addressing::{Gpa, Pa};

/// Traits to probe guest memory mappings.
pub trait Probe {
    /// Translate guest physical address to host physical address
    fn gpa2hpa(&self, vm: &Vm, gpa: Gpa) -> Option<Pa>;
}

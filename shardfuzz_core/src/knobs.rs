//! Named dials parametrizing the engine's randomized choices.
//!
//! A knob is one byte in a fixed-size array. Call sites allocate a
//! [`KnobId`] once per process (typically into a `static` via `OnceLock`)
//! and read the byte through a [`Knobs`] value, so the whole decision
//! surface of the engine can be set from the outside as a flat byte string.
//! Values are interpreted per knob: most act as probability weights where 0
//! means "never or default" and 255 means "frequently".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Total number of knobs.
pub const NUM_KNOBS: usize = 32;

/// Opaque handle to one knob, comparable and copyable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnobId(usize);

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
static KNOB_NAMES: Mutex<[&str; NUM_KNOBS]> = Mutex::new([""; NUM_KNOBS]);

/// The values of all knobs, as loaded by the engine at startup.
#[derive(Debug, Clone, Default)]
pub struct Knobs {
    values: [u8; NUM_KNOBS],
}

impl Knobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh knob id and records its name.
    ///
    /// Ids are allocated process-wide and never reused; allocation order is
    /// stable for a given build of the engine. Panics when all ids are
    /// taken.
    pub fn new_id(name: &'static str) -> KnobId {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id < NUM_KNOBS, "out of knob ids (limit {NUM_KNOBS}): {name}");
        KNOB_NAMES.lock().expect("knob registry poisoned")[id] = name;
        KnobId(id)
    }

    /// Returns the name `knob_id` was registered with.
    pub fn name(knob_id: KnobId) -> &'static str {
        KNOB_NAMES.lock().expect("knob registry poisoned")[knob_id.0]
    }

    pub fn value(&self, knob_id: KnobId) -> u8 {
        self.values[knob_id.0]
    }

    /// Sets a single knob.
    pub fn set_value(&mut self, knob_id: KnobId, value: u8) {
        self.values[knob_id.0] = value;
    }

    /// Sets every knob to `value`.
    pub fn set_all(&mut self, value: u8) {
        self.values = [value; NUM_KNOBS];
    }

    /// Sets the first `values.len()` knobs from `values`; extra input bytes
    /// are ignored.
    pub fn set(&mut self, values: &[u8]) {
        let n = values.len().min(NUM_KNOBS);
        self.values[..n].copy_from_slice(&values[..n]);
    }

    /// Calls `callback(name, value)` for every allocated knob.
    pub fn for_each_knob(&self, mut callback: impl FnMut(&'static str, u8)) {
        let allocated = NEXT_ID.load(Ordering::Relaxed).min(NUM_KNOBS);
        let names = KNOB_NAMES.lock().expect("knob registry poisoned");
        for id in 0..allocated {
            callback(names[id], self.values[id]);
        }
    }

    /// Picks one of `choices`, using the knob values behind `knob_ids` as
    /// probability weights. When all weights are zero the choice is
    /// uniform.
    ///
    /// # Panics
    ///
    /// Panics when `choices` is empty or the spans differ in length.
    pub fn choose<T: Copy>(&self, knob_ids: &[KnobId], choices: &[T], random: u64) -> T {
        assert!(!choices.is_empty(), "choose: no choices");
        assert_eq!(knob_ids.len(), choices.len(), "choose: mismatched spans");
        let sum: u64 = knob_ids.iter().map(|&id| self.value(id) as u64).sum();
        if sum == 0 {
            return choices[(random % choices.len() as u64) as usize];
        }
        let random = random % sum;
        let mut partial_sum = 0u64;
        for (&id, &choice) in knob_ids.iter().zip(choices) {
            partial_sum += self.value(id) as u64;
            if partial_sum > random {
                return choice;
            }
        }
        unreachable!("choose: partial sums did not reach the total");
    }

    /// Chooses between two strategies.
    ///
    /// Knob value 0 or 255 yields `default_value`; 1 yields `false`; 254
    /// yields `true`; everything in between biases linearly toward `true`
    /// with both outcomes possible.
    pub fn generate_bool(&self, knob_id: KnobId, default_value: bool, random: u64) -> bool {
        let value = self.value(knob_id);
        match value {
            0 | 255 => default_value,
            1 => false,
            254 => true,
            _ => {
                // value is in [2, 253]; 252 values remain after the special
                // cases above.
                let value_minus2 = (value - 2) as u64;
                (random % 252) <= value_minus2
            }
        }
    }
}

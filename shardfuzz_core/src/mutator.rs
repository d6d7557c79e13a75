//! Byte-level mutation used by the default command callbacks.
//!
//! The strategy mix is knob-weighted: each operator's probability weight is
//! one knob, so the whole mutation policy can be tuned from outside. With
//! all knobs at zero the choice is uniform.

use crate::knobs::{KnobId, Knobs};
use rand::Rng;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationOp {
    AddToByte,
    FlipBit,
    InsertByte,
    EraseByte,
}

const MUTATION_OPS: [MutationOp; 4] = [
    MutationOp::AddToByte,
    MutationOp::FlipBit,
    MutationOp::InsertByte,
    MutationOp::EraseByte,
];

fn mutation_knob_ids() -> &'static [KnobId; 4] {
    static IDS: OnceLock<[KnobId; 4]> = OnceLock::new();
    IDS.get_or_init(|| {
        [
            Knobs::new_id("mutate_add_to_byte"),
            Knobs::new_id("mutate_flip_bit"),
            Knobs::new_id("mutate_insert_byte"),
            Knobs::new_id("mutate_erase_byte"),
        ]
    })
}

/// Applies one random byte-level operator per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteMutator;

impl ByteMutator {
    pub fn new() -> Self {
        Self
    }

    pub fn mutate<R: Rng + ?Sized>(&self, input: &mut Vec<u8>, knobs: &Knobs, rng: &mut R) {
        if input.is_empty() {
            input.push(0);
        }
        let op = knobs.choose(mutation_knob_ids(), &MUTATION_OPS, rng.random());
        match op {
            MutationOp::AddToByte => {
                let index = rng.random_range(0..input.len());
                let delta = rng.random_range(1u8..=15);
                input[index] = input[index].wrapping_add(delta);
            }
            MutationOp::FlipBit => {
                let index = rng.random_range(0..input.len());
                let bit = rng.random_range(0..8);
                input[index] ^= 1 << bit;
            }
            MutationOp::InsertByte => {
                let position = rng.random_range(0..=input.len());
                input.insert(position, rng.random());
            }
            MutationOp::EraseByte => {
                if input.len() > 1 {
                    let index = rng.random_range(0..input.len());
                    input.remove(index);
                }
            }
        }
    }
}

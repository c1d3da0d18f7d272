//! Configuration types for fuzzing and replay runs.

use serde::{Deserialize, Serialize};

/// Per-pass chances, all expressed as percentages in `0..=100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassChances {
    /// Chance of rebuilding a bitwise instruction one bit at a time
    pub adding_bit_instruction_synonym: u32,
    /// Chance of inserting a copy-object synonym before an instruction
    pub adding_copy_object_synonym: u32,
    /// Chance of merging synonyms at a block with a new phi
    pub adding_opphi_synonym: u32,
    /// Chance of proving a constant equal to the result of a counting loop
    pub adding_loop_to_create_int_constant_synonym: u32,
    /// Chance of giving a loop header a dedicated preheader
    pub adding_loop_preheader: u32,
    /// Chance of substituting a use of an irrelevant id
    pub replacing_irrelevant_id: u32,
    /// Chance of considering a selection header for flattening
    pub flattening_conditional_branch: u32,
    /// Chance of merging the returns of a function
    pub merging_function_returns: u32,
    /// Chance of outlining a region of a function
    pub outlining_function: u32,
}

impl Default for PassChances {
    fn default() -> Self {
        Self {
            adding_bit_instruction_synonym: 5,
            adding_copy_object_synonym: 20,
            adding_opphi_synonym: 30,
            adding_loop_to_create_int_constant_synonym: 10,
            adding_loop_preheader: 40,
            replacing_irrelevant_id: 40,
            flattening_conditional_branch: 50,
            merging_function_returns: 25,
            outlining_function: 15,
        }
    }
}

/// Fuzzer run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Stop once this many transformations have been applied
    pub transformation_limit: usize,
    /// Stop after this many passes, even if few transformations applied
    pub max_passes: usize,
    /// Distance between the module's id bound and the first overflow id
    pub overflow_id_gap: u32,
    /// Validate the module after every pass (slow, used to catch engine bugs)
    pub validate_after_each_pass: bool,
    /// Pass chances
    pub chances: PassChances,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            transformation_limit: 2_000,
            max_passes: 40,
            overflow_id_gap: 0x0010_0000,
            validate_after_each_pass: false,
            chances: PassChances::default(),
        }
    }
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// First id handed out by the overflow pool; must match the fuzzing run
    pub first_overflow_id: u32,
    /// Replay only this many records from the start of the sequence
    pub num_transformations_to_apply: Option<usize>,
    /// Validate the module after every applied transformation
    pub validate_after_each_transformation: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            first_overflow_id: 0x0010_0000,
            num_transformations_to_apply: None,
            validate_after_each_transformation: false,
        }
    }
}

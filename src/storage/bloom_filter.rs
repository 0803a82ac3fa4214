/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bloom filter carried in primary-key stats logs
//!
//! Lets readers skip a compacted segment when a primary key is definitely not
//! in it. Sized from the segment's row count at pack time.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::core::{CompactionError, Result};

/// Default false positive rate for primary-key filters
pub const PK_FALSE_POSITIVE_RATE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    bit_array: Vec<u64>,
    hash_functions: usize,
    total_bits: usize,
    element_count: usize,
}

impl BloomFilter {
    /// Filter sized for `expected_elements` at `false_positive_rate`
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let expected_elements = expected_elements.max(1);
        let total_bits = Self::optimal_bit_count(expected_elements, false_positive_rate).max(64);
        let hash_functions = Self::optimal_hash_count(expected_elements, total_bits);

        Self {
            bit_array: vec![0u64; (total_bits + 63) / 64],
            hash_functions,
            total_bits,
            element_count: 0,
        }
    }

    pub fn for_primary_keys(row_count: usize) -> Self {
        Self::new(row_count, PK_FALSE_POSITIVE_RATE)
    }

    pub fn insert<T: Hash>(&mut self, element: &T) {
        let (hash1, hash2) = Self::hash_pair(element);
        for i in 0..self.hash_functions {
            let bit_index = self.bit_index(hash1, hash2, i);
            self.bit_array[bit_index / 64] |= 1u64 << (bit_index % 64);
        }
        self.element_count += 1;
    }

    /// `false` means definitely absent
    pub fn might_contain<T: Hash>(&self, element: &T) -> bool {
        let (hash1, hash2) = Self::hash_pair(element);
        (0..self.hash_functions).all(|i| {
            let bit_index = self.bit_index(hash1, hash2, i);
            self.bit_array[bit_index / 64] & (1u64 << (bit_index % 64)) != 0
        })
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Both filters must share bit and hash-function counts
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if self.total_bits != other.total_bits || self.hash_functions != other.hash_functions {
            return Err(CompactionError::Internal(
                "cannot merge bloom filters with different parameters".to_string(),
            ));
        }
        for (word, other_word) in self.bit_array.iter_mut().zip(&other.bit_array) {
            *word |= *other_word;
        }
        self.element_count += other.element_count;
        Ok(())
    }

    fn optimal_bit_count(expected_elements: usize, false_positive_rate: f64) -> usize {
        let bits =
            -(expected_elements as f64 * false_positive_rate.ln()) / std::f64::consts::LN_2.powi(2);
        bits.ceil() as usize
    }

    fn optimal_hash_count(expected_elements: usize, total_bits: usize) -> usize {
        let hash_count = (total_bits as f64 / expected_elements as f64) * std::f64::consts::LN_2;
        hash_count.round().max(1.0) as usize
    }

    fn hash_pair<T: Hash>(element: &T) -> (u64, u64) {
        let mut hasher1 = DefaultHasher::new();
        element.hash(&mut hasher1);

        let mut hasher2 = DefaultHasher::new();
        (element, 0xDEADBEEFu64).hash(&mut hasher2);

        (hasher1.finish(), hasher2.finish())
    }

    // Double hashing: h1 + i * h2
    fn bit_index(&self, hash1: u64, hash2: u64, i: usize) -> usize {
        (hash1.wrapping_add((i as u64).wrapping_mul(hash2)) % self.total_bits as u64) as usize
    }
}

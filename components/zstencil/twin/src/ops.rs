//! Depth and stencil register state and the per-sample test.

use rsim_core::{CompareFunction, StencilUpdate};

use crate::memory::{depth_of, pack, stencil_of, DEPTH_MASK};

#[derive(Debug, Clone, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_function: CompareFunction,
    pub depth_mask: bool,
    pub clear_depth: u32,
    pub stencil_test: bool,
    pub stencil_function: CompareFunction,
    pub stencil_reference: u8,
    pub stencil_test_mask: u8,
    pub stencil_update_mask: u8,
    pub stencil_fail: StencilUpdate,
    pub depth_fail: StencilUpdate,
    pub depth_pass: StencilUpdate,
    pub clear_stencil: u8,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_function: CompareFunction::Less,
            depth_mask: true,
            clear_depth: DEPTH_MASK,
            stencil_test: false,
            stencil_function: CompareFunction::Always,
            stencil_reference: 0,
            stencil_test_mask: 0xff,
            stencil_update_mask: 0xff,
            stencil_fail: StencilUpdate::Keep,
            depth_fail: StencilUpdate::Keep,
            depth_pass: StencilUpdate::Keep,
            clear_stencil: 0,
        }
    }
}

impl DepthStencilState {
    /// Stamps need the Z cache at all.
    pub fn active(&self) -> bool {
        self.depth_test || self.stencil_test
    }

    pub fn clear_word(&self) -> u32 {
        pack(self.clear_depth, self.clear_stencil)
    }

    /// Test one sample of depth `z` against the stored word. Returns whether
    /// the sample survives and the word to store.
    pub fn test_sample(&self, z: u32, stored: u32) -> (bool, u32) {
        let depth = depth_of(stored);
        let stencil = stencil_of(stored);
        let stencil_pass = !self.stencil_test
            || self.stencil_function.test(
                (self.stencil_reference & self.stencil_test_mask) as u32,
                (stencil & self.stencil_test_mask) as u32,
            );
        let depth_pass = !self.depth_test || self.depth_function.test(z & DEPTH_MASK, depth);

        let new_stencil = if self.stencil_test {
            let op = if !stencil_pass {
                self.stencil_fail
            } else if !depth_pass {
                self.depth_fail
            } else {
                self.depth_pass
            };
            let updated = op.apply(stencil, self.stencil_reference);
            (stencil & !self.stencil_update_mask) | (updated & self.stencil_update_mask)
        } else {
            stencil
        };
        let passed = stencil_pass && depth_pass;
        let new_depth = if passed && self.depth_test && self.depth_mask {
            z & DEPTH_MASK
        } else {
            depth
        };
        (passed, pack(new_depth, new_stencil))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_less_writes_nearer_samples() {
        let s = DepthStencilState {
            depth_test: true,
            ..DepthStencilState::default()
        };
        assert_eq!(s.test_sample(10, pack(20, 0)), (true, pack(10, 0)));
        assert_eq!(s.test_sample(30, pack(20, 0)), (false, pack(20, 0)));
    }

    #[test]
    fn depth_mask_off_keeps_stored_depth() {
        let s = DepthStencilState {
            depth_test: true,
            depth_mask: false,
            ..DepthStencilState::default()
        };
        assert_eq!(s.test_sample(10, pack(20, 0)), (true, pack(20, 0)));
    }

    #[test]
    fn stencil_ops_follow_the_failing_test() {
        let s = DepthStencilState {
            depth_test: true,
            stencil_test: true,
            stencil_function: CompareFunction::Equal,
            stencil_reference: 1,
            stencil_fail: StencilUpdate::Zero,
            depth_fail: StencilUpdate::Incr,
            depth_pass: StencilUpdate::Replace,
            ..DepthStencilState::default()
        };
        // Stencil fails: zeroed, depth kept.
        assert_eq!(s.test_sample(5, pack(50, 2)), (false, pack(50, 0)));
        // Stencil passes, depth fails: incremented.
        assert_eq!(s.test_sample(60, pack(50, 1)), (false, pack(50, 2)));
        // Both pass: replaced with the reference, depth written.
        assert_eq!(s.test_sample(5, pack(50, 1)), (true, pack(5, 1)));
    }

    #[test]
    fn update_mask_limits_stencil_writes() {
        let s = DepthStencilState {
            stencil_test: true,
            stencil_update_mask: 0x0f,
            depth_pass: StencilUpdate::Invert,
            ..DepthStencilState::default()
        };
        assert_eq!(s.test_sample(0, pack(0, 0xa5)), (true, pack(0, 0xaa)));
    }

    #[test]
    fn disabled_tests_pass_untouched() {
        let s = DepthStencilState::default();
        assert!(!s.active());
        assert_eq!(s.test_sample(99, pack(1, 3)), (true, pack(1, 3)));
    }
}

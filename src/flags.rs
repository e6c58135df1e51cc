use bitflags::bitflags;

use crate::traits::Width;

/// FLAGS bits with no storage behind them on the 8086/8088: bits 15-12 and
/// bit 1 always read back as set.
pub const RESERVED_FLAG_BITS: u16 = 0xF002;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u16 {
        const CARRY = 0x0001;
        const PARITY = 0x0004;
        const AUX_CARRY = 0x0010;
        const ZERO = 0x0040;
        const SIGN = 0x0080;
        const TRAP = 0x0100;
        const INTERRUPT = 0x0200;
        const DIRECTION = 0x0400;
        const OVERFLOW = 0x0800;
    }
}

impl CpuFlags {
    /// Power-on state: everything clear, interrupts disabled until STI.
    pub fn power_on() -> CpuFlags {
        CpuFlags::empty()
    }

    /// The 16-bit image pushed by PUSHF and interrupt entry.
    pub fn packed_value(&self) -> u16 {
        self.bits() | RESERVED_FLAG_BITS
    }

    /// Overwrite every condition code from a 16-bit image (POPF, IRET).
    /// Reserved bits in `value` are ignored.
    pub fn set_packed(&mut self, value: u16) {
        *self = CpuFlags::from_bits_truncate(value);
    }

    /// Derive zero/sign/parity (and optionally carry) from a raw ALU result
    /// computed in a type wider than the operand width. Carry is the result
    /// having overflowed past the operand width. Parity always covers the
    /// low byte only.
    pub fn set_from_result(&mut self, raw: u32, width: Width, update_carry: bool) {
        self.set(CpuFlags::ZERO, raw & width.mask() == 0);
        self.set(CpuFlags::SIGN, raw & width.sign_mask() != 0);
        if update_carry {
            self.set(CpuFlags::CARRY, raw & !width.mask() != 0);
        }
        self.set(CpuFlags::PARITY, (raw as u8).count_ones() % 2 == 0);
    }

    /// AND/OR/XOR/TEST leave carry and overflow clear, never set.
    pub fn clear_logical(&mut self) {
        self.remove(CpuFlags::CARRY | CpuFlags::OVERFLOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_value_forces_reserved_bits() {
        let flags = CpuFlags::power_on();
        assert_eq!(flags.packed_value(), 0xF002);

        let flags = CpuFlags::CARRY | CpuFlags::ZERO;
        assert_eq!(flags.packed_value(), 0xF002 | 0x0041);
    }

    #[test]
    fn set_packed_ignores_reserved_bits() {
        let mut flags = CpuFlags::power_on();
        flags.set_packed(0xFFFF);
        assert_eq!(flags, CpuFlags::all());
        assert_eq!(flags.packed_value(), 0xFFD7 | RESERVED_FLAG_BITS);

        flags.set_packed(0x0000);
        assert_eq!(flags, CpuFlags::empty());
    }

    #[test]
    fn packed_round_trip() {
        let mut flags = CpuFlags::power_on();
        flags.insert(CpuFlags::SIGN | CpuFlags::INTERRUPT | CpuFlags::DIRECTION);
        let packed = flags.packed_value();

        let mut restored = CpuFlags::power_on();
        restored.set_packed(packed);
        assert_eq!(restored, flags);
    }

    #[test]
    fn result_flags_byte() {
        let mut flags = CpuFlags::power_on();
        // 0xFF + 0x01 = 0x100: zero result in 8 bits, carry out
        flags.set_from_result(0x100, Width::Byte, true);
        assert!(flags.contains(CpuFlags::ZERO));
        assert!(flags.contains(CpuFlags::CARRY));
        assert!(!flags.contains(CpuFlags::SIGN));
        assert!(flags.contains(CpuFlags::PARITY));
    }

    #[test]
    fn result_flags_word_parity_covers_low_byte() {
        let mut flags = CpuFlags::power_on();
        // 0xFF00: low byte has zero set bits, so parity is even
        flags.set_from_result(0xFF00, Width::Word, true);
        assert!(flags.contains(CpuFlags::PARITY));
        assert!(flags.contains(CpuFlags::SIGN));
        assert!(!flags.contains(CpuFlags::CARRY));
        assert!(!flags.contains(CpuFlags::ZERO));
    }

    #[test]
    fn carry_not_touched_unless_requested() {
        let mut flags = CpuFlags::CARRY;
        flags.set_from_result(0x01, Width::Byte, false);
        assert!(flags.contains(CpuFlags::CARRY));
    }

    #[test]
    fn clear_logical_clears_carry_and_overflow() {
        let mut flags = CpuFlags::CARRY | CpuFlags::OVERFLOW | CpuFlags::SIGN;
        flags.clear_logical();
        assert!(!flags.contains(CpuFlags::CARRY));
        assert!(!flags.contains(CpuFlags::OVERFLOW));
        assert!(flags.contains(CpuFlags::SIGN));
    }
}

use num_conv::CastSigned;
use tracing::{debug, trace};

use crate::{
    bus::{Bus, physical_address},
    error::CpuError,
    flags::CpuFlags,
    instructions::{AluOp, Direction, Operand, RepPrefix, ShiftOp, StringOp, parse_mod_rm_byte},
    operations,
    registers::{ByteReg, RegisterFile, SegReg, WordReg},
    traits::Width,
};

/// An 8088-compatible CPU attached to a [`Bus`].
///
/// The register file, flags and prefix state are owned here; everything else
/// (memory, ports, the interrupt controller) is reached through the bus.
/// [`Cpu::fetch`] runs exactly one instruction, prefixes included.
pub struct Cpu<B: Bus> {
    pub regs: RegisterFile,
    pub flags: CpuFlags,
    pub ip: u16,
    bus: B,
    seg_override: Option<SegReg>,
    rep: RepPrefix,
    halted: bool,
}

impl<B: Bus> Cpu<B> {
    pub fn new(bus: B) -> Cpu<B> {
        Cpu {
            regs: RegisterFile::power_on(),
            flags: CpuFlags::power_on(),
            ip: 0,
            bus,
            seg_override: None,
            rep: RepPrefix::None,
            halted: false,
        }
    }

    /// Replace the attached bus, keeping CPU state.
    pub fn install_bus(&mut self, bus: B) {
        self.bus = bus;
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Back to the power-on state; bus contents are untouched.
    pub fn reset(&mut self) {
        self.regs = RegisterFile::power_on();
        self.flags = CpuFlags::power_on();
        self.ip = 0;
        self.seg_override = None;
        self.rep = RepPrefix::None;
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn dump_registers(&self) {
        println!(
            "ax: 0x{:04X}    bx: 0x{:04X}
cx: 0x{:04X}    dx: 0x{:04X}
si: 0x{:04X}    di: 0x{:04X}
bp: 0x{:04X}    sp: 0x{:04X}
cs: 0x{:04X}    ds: 0x{:04X}
es: 0x{:04X}    ss: 0x{:04X}
ip: 0x{:04X} flags: 0x{:04X}",
            self.regs.get(WordReg::Ax),
            self.regs.get(WordReg::Bx),
            self.regs.get(WordReg::Cx),
            self.regs.get(WordReg::Dx),
            self.regs.get(WordReg::Si),
            self.regs.get(WordReg::Di),
            self.regs.get(WordReg::Bp),
            self.regs.get(WordReg::Sp),
            self.regs.get_seg(SegReg::Cs),
            self.regs.get_seg(SegReg::Ds),
            self.regs.get_seg(SegReg::Es),
            self.regs.get_seg(SegReg::Ss),
            self.ip,
            self.flags.packed_value(),
        );
    }

    /// Run one full instruction: poll the interrupt line, consume prefixes,
    /// dispatch the opcode. A halted CPU only polls.
    pub fn fetch(&mut self) -> Result<(), CpuError> {
        if self.flags.contains(CpuFlags::INTERRUPT) && self.bus.interrupt_pending() {
            let vector = self.bus.pop_interrupt_vector();
            self.service_interrupt(vector);
        }
        if self.halted {
            return Ok(());
        }

        self.seg_override = None;
        self.rep = RepPrefix::None;
        let (opcode, cs, ip) = loop {
            let cs = self.regs.get_seg(SegReg::Cs);
            let ip = self.ip;
            match self.fetch_u8() {
                0x26 => self.seg_override = Some(SegReg::Es),
                0x2E => self.seg_override = Some(SegReg::Cs),
                0x36 => self.seg_override = Some(SegReg::Ss),
                0x3E => self.seg_override = Some(SegReg::Ds),
                0xF2 => self.rep = RepPrefix::WhileNotEqual,
                0xF3 => self.rep = RepPrefix::WhileEqual,
                0xF0 => {} // LOCK asserts bus arbitration we don't model
                opcode => break (opcode, cs, ip),
            }
        };

        trace!(opcode, cs, ip, "execute");
        self.execute(opcode, cs, ip)?;

        // A repeat prefix still pending here was attached to an opcode that
        // does not repeat; report it against that opcode.
        if self.rep != RepPrefix::None {
            return Err(CpuError::UnsupportedPrefix { opcode, cs, ip });
        }
        Ok(())
    }

    fn execute(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        match opcode {
            // ALU op r/m,reg and reg,r/m
            0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B
            | 0x30..=0x33 | 0x38..=0x3B => {
                let op = AluOp::from_code(opcode >> 3);
                self.alu_modrm(op, Width::from_op(opcode), Direction::from_op(opcode));
            }
            // ALU op accumulator, immediate
            0x04 | 0x05 | 0x0C | 0x0D | 0x14 | 0x15 | 0x1C | 0x1D | 0x24 | 0x25 | 0x2C | 0x2D
            | 0x34 | 0x35 | 0x3C | 0x3D => {
                let op = AluOp::from_code(opcode >> 3);
                self.alu_acc_imm(op, Width::from_op(opcode));
            }
            0x06 | 0x0E | 0x16 | 0x1E => {
                let value = self.regs.get_seg(SegReg::from_code(opcode >> 3));
                self.push(value);
            }
            0x07 | 0x17 | 0x1F => {
                let value = self.pop();
                self.regs.set_seg(SegReg::from_code(opcode >> 3), value);
            }
            0x27 => self.daa(),
            0x2F => self.das(),
            0x37 => self.aaa(),
            0x3F => self.aas(),
            0x40..=0x47 => {
                let reg = WordReg::from_code(opcode);
                let value = operations::inc(self.regs.get(reg), &mut self.flags);
                self.regs.set(reg, value);
            }
            0x48..=0x4F => {
                let reg = WordReg::from_code(opcode);
                let value = operations::dec(self.regs.get(reg), &mut self.flags);
                self.regs.set(reg, value);
            }
            0x50..=0x57 => {
                let reg = WordReg::from_code(opcode);
                let value = self.regs.get(reg);
                // PUSH SP stores the already-decremented pointer (8088 quirk)
                let value = if reg == WordReg::Sp {
                    value.wrapping_sub(2)
                } else {
                    value
                };
                self.push(value);
            }
            0x58..=0x5F => {
                let value = self.pop();
                self.regs.set(WordReg::from_code(opcode), value);
            }
            0x70..=0x7F => {
                let displacement = self.fetch_u8() as i8;
                if self.condition(opcode & 0x0F) {
                    self.jump_relative(displacement as u16);
                }
            }
            0x80..=0x83 => self.alu_group_imm(opcode),
            0x84 | 0x85 => self.test_modrm(Width::from_op(opcode)),
            0x86 | 0x87 => self.xchg_modrm(Width::from_op(opcode)),
            0x88..=0x8B => self.mov_modrm(Width::from_op(opcode), Direction::from_op(opcode)),
            0x8C => {
                let (reg_field, operand) = self.decode_modrm();
                let value = self.regs.get_seg(SegReg::from_code(reg_field));
                self.write_operand_word(operand, value);
            }
            0x8D => self.lea(opcode, cs, ip)?,
            0x8E => {
                let (reg_field, operand) = self.decode_modrm();
                let value = self.read_operand_word(operand);
                self.regs.set_seg(SegReg::from_code(reg_field), value);
            }
            0x8F => {
                let (reg_field, operand) = self.decode_modrm();
                if reg_field != 0 {
                    return Err(CpuError::InvalidOpcode { opcode, cs, ip });
                }
                let value = self.pop();
                self.write_operand_word(operand, value);
            }
            0x90 => {} // NOP (XCHG AX, AX)
            0x91..=0x97 => {
                let reg = WordReg::from_code(opcode);
                let ax = self.regs.get(WordReg::Ax);
                let other = self.regs.get(reg);
                self.regs.set(WordReg::Ax, other);
                self.regs.set(reg, ax);
            }
            0x98 => {
                // CBW
                let al = self.regs.get_byte(ByteReg::Al);
                self.regs.set(WordReg::Ax, i16::from(al.cast_signed()) as u16);
            }
            0x99 => {
                // CWD
                let high = if self.regs.get(WordReg::Ax) & 0x8000 != 0 {
                    0xFFFF
                } else {
                    0x0000
                };
                self.regs.set(WordReg::Dx, high);
            }
            0x9A => {
                let target_ip = self.fetch_u16();
                let target_cs = self.fetch_u16();
                self.push(self.regs.get_seg(SegReg::Cs));
                self.push(self.ip);
                self.regs.set_seg(SegReg::Cs, target_cs);
                self.ip = target_ip;
            }
            0x9B => {} // WAIT: no coprocessor to wait on
            0x9C => self.push(self.flags.packed_value()),
            0x9D => {
                let value = self.pop();
                self.flags.set_packed(value);
            }
            0x9E => {
                // SAHF replaces the low flag byte from AH
                let packed = self.flags.packed_value();
                let ah = self.regs.get_byte(ByteReg::Ah);
                self.flags.set_packed((packed & 0xFF00) | u16::from(ah));
            }
            0x9F => {
                let packed = self.flags.packed_value();
                self.regs.set_byte(ByteReg::Ah, packed as u8);
            }
            0xA0 => {
                let offset = self.fetch_u16();
                let segment = self.seg_override.unwrap_or(SegReg::Ds);
                let value = self.read_mem_byte(segment, offset);
                self.regs.set_byte(ByteReg::Al, value);
            }
            0xA1 => {
                let offset = self.fetch_u16();
                let segment = self.seg_override.unwrap_or(SegReg::Ds);
                let value = self.read_mem_word(segment, offset);
                self.regs.set(WordReg::Ax, value);
            }
            0xA2 => {
                let offset = self.fetch_u16();
                let segment = self.seg_override.unwrap_or(SegReg::Ds);
                let value = self.regs.get_byte(ByteReg::Al);
                self.write_mem_byte(segment, offset, value);
            }
            0xA3 => {
                let offset = self.fetch_u16();
                let segment = self.seg_override.unwrap_or(SegReg::Ds);
                let value = self.regs.get(WordReg::Ax);
                self.write_mem_word(segment, offset, value);
            }
            0xA4 | 0xA5 => self.string_instruction(StringOp::Movs, Width::from_op(opcode)),
            0xA6 | 0xA7 => self.string_instruction(StringOp::Cmps, Width::from_op(opcode)),
            0xA8 => {
                let imm = self.fetch_u8();
                operations::bitwise_and(self.regs.get_byte(ByteReg::Al), imm, &mut self.flags);
            }
            0xA9 => {
                let imm = self.fetch_u16();
                operations::bitwise_and(self.regs.get(WordReg::Ax), imm, &mut self.flags);
            }
            0xAA | 0xAB => self.string_instruction(StringOp::Stos, Width::from_op(opcode)),
            0xAC | 0xAD => self.string_instruction(StringOp::Lods, Width::from_op(opcode)),
            0xAE | 0xAF => self.string_instruction(StringOp::Scas, Width::from_op(opcode)),
            0xB0..=0xB7 => {
                let value = self.fetch_u8();
                self.regs.set_byte(ByteReg::from_code(opcode), value);
            }
            0xB8..=0xBF => {
                let value = self.fetch_u16();
                self.regs.set(WordReg::from_code(opcode), value);
            }
            0xC2 => {
                let adjust = self.fetch_u16();
                self.ip = self.pop();
                let sp = self.regs.get(WordReg::Sp).wrapping_add(adjust);
                self.regs.set(WordReg::Sp, sp);
            }
            0xC3 => self.ip = self.pop(),
            0xC4 => self.load_far_pointer(SegReg::Es, opcode, cs, ip)?,
            0xC5 => self.load_far_pointer(SegReg::Ds, opcode, cs, ip)?,
            0xC6 => {
                let (_, operand) = self.decode_modrm();
                let value = self.fetch_u8();
                self.write_operand_byte(operand, value);
            }
            0xC7 => {
                let (_, operand) = self.decode_modrm();
                let value = self.fetch_u16();
                self.write_operand_word(operand, value);
            }
            0xCA => {
                let adjust = self.fetch_u16();
                self.ip = self.pop();
                let value = self.pop();
                self.regs.set_seg(SegReg::Cs, value);
                let sp = self.regs.get(WordReg::Sp).wrapping_add(adjust);
                self.regs.set(WordReg::Sp, sp);
            }
            0xCB => {
                self.ip = self.pop();
                let value = self.pop();
                self.regs.set_seg(SegReg::Cs, value);
            }
            0xCC => self.service_interrupt(3),
            0xCD => {
                let vector = self.fetch_u8();
                self.service_interrupt(vector);
            }
            0xCE => {
                if self.flags.contains(CpuFlags::OVERFLOW) {
                    self.service_interrupt(4);
                }
            }
            0xCF => {
                // IRET undoes interrupt entry: IP, CS, then the full flags
                self.ip = self.pop();
                let value = self.pop();
                self.regs.set_seg(SegReg::Cs, value);
                let packed = self.pop();
                self.flags.set_packed(packed);
            }
            0xD0..=0xD3 => self.shift_group(opcode, cs, ip)?,
            0xD4 => {
                let base = self.fetch_u8();
                self.aam(base);
            }
            0xD5 => {
                let base = self.fetch_u8();
                self.aad(base);
            }
            0xD7 => {
                // XLAT
                let al = self.regs.get_byte(ByteReg::Al);
                let offset = self.regs.get(WordReg::Bx).wrapping_add(u16::from(al));
                let segment = self.seg_override.unwrap_or(SegReg::Ds);
                let value = self.read_mem_byte(segment, offset);
                self.regs.set_byte(ByteReg::Al, value);
            }
            0xD8..=0xDF => {
                // ESC: no 8087 attached; consume the operand and move on
                let _ = self.decode_modrm();
            }
            0xE0 => {
                let displacement = self.fetch_u8() as i8;
                if self.decrement_cx() != 0 && !self.flags.contains(CpuFlags::ZERO) {
                    self.jump_relative(displacement as u16);
                }
            }
            0xE1 => {
                let displacement = self.fetch_u8() as i8;
                if self.decrement_cx() != 0 && self.flags.contains(CpuFlags::ZERO) {
                    self.jump_relative(displacement as u16);
                }
            }
            0xE2 => {
                let displacement = self.fetch_u8() as i8;
                if self.decrement_cx() != 0 {
                    self.jump_relative(displacement as u16);
                }
            }
            0xE3 => {
                let displacement = self.fetch_u8() as i8;
                if self.regs.get(WordReg::Cx) == 0 {
                    self.jump_relative(displacement as u16);
                }
            }
            0xE4 => {
                let port = u16::from(self.fetch_u8());
                self.input_byte(port);
            }
            0xE5 => {
                let port = u16::from(self.fetch_u8());
                self.input_word(port);
            }
            0xE6 => {
                let port = u16::from(self.fetch_u8());
                self.output_byte(port);
            }
            0xE7 => {
                let port = u16::from(self.fetch_u8());
                self.output_word(port);
            }
            0xE8 => {
                let displacement = self.fetch_u16();
                self.push(self.ip);
                self.jump_relative(displacement);
            }
            0xE9 => {
                let displacement = self.fetch_u16();
                self.jump_relative(displacement);
            }
            0xEA => {
                let target_ip = self.fetch_u16();
                let target_cs = self.fetch_u16();
                self.regs.set_seg(SegReg::Cs, target_cs);
                self.ip = target_ip;
            }
            0xEB => {
                let displacement = self.fetch_u8() as i8;
                self.jump_relative(displacement as u16);
            }
            0xEC => self.input_byte(self.regs.get(WordReg::Dx)),
            0xED => self.input_word(self.regs.get(WordReg::Dx)),
            0xEE => self.output_byte(self.regs.get(WordReg::Dx)),
            0xEF => self.output_word(self.regs.get(WordReg::Dx)),
            0xF4 => {
                debug!(cs, ip, "halt");
                self.halted = true;
            }
            0xF5 => {
                self.flags.toggle(CpuFlags::CARRY);
            }
            0xF6 | 0xF7 => self.group3(opcode, cs, ip)?,
            0xF8 => self.flags.remove(CpuFlags::CARRY),
            0xF9 => self.flags.insert(CpuFlags::CARRY),
            0xFA => self.flags.remove(CpuFlags::INTERRUPT),
            0xFB => self.flags.insert(CpuFlags::INTERRUPT),
            0xFC => self.flags.remove(CpuFlags::DIRECTION),
            0xFD => self.flags.insert(CpuFlags::DIRECTION),
            0xFE => self.group4(opcode, cs, ip)?,
            0xFF => self.group5(opcode, cs, ip)?,
            _ => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
        Ok(())
    }

    // --- instruction stream ---

    fn fetch_u8(&mut self) -> u8 {
        let addr = physical_address(self.regs.get_seg(SegReg::Cs), self.ip);
        let byte = self.bus.mem_read_byte(addr);
        self.ip = self.ip.wrapping_add(1);
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let low = self.fetch_u8();
        let high = self.fetch_u8();
        u16::from_le_bytes([low, high])
    }

    fn jump_relative(&mut self, displacement: u16) {
        self.ip = self.ip.wrapping_add(displacement);
    }

    // --- data memory, through the active segment ---

    fn read_mem_byte(&self, segment: SegReg, offset: u16) -> u8 {
        self.bus
            .mem_read_byte(physical_address(self.regs.get_seg(segment), offset))
    }

    fn write_mem_byte(&mut self, segment: SegReg, offset: u16, value: u8) {
        self.bus
            .mem_write_byte(physical_address(self.regs.get_seg(segment), offset), value);
    }

    /// Word access wraps the offset within the segment, not the physical
    /// address.
    fn read_mem_word(&self, segment: SegReg, offset: u16) -> u16 {
        let low = self.read_mem_byte(segment, offset);
        let high = self.read_mem_byte(segment, offset.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    fn write_mem_word(&mut self, segment: SegReg, offset: u16, value: u16) {
        let bytes = value.to_le_bytes();
        self.write_mem_byte(segment, offset, bytes[0]);
        self.write_mem_byte(segment, offset.wrapping_add(1), bytes[1]);
    }

    // --- addressing ---

    /// Consume a ModRM byte plus any displacement. Returns the raw 3-bit reg
    /// field (a register code or a group sub-opcode, per the caller) and the
    /// resolved register-or-memory operand.
    fn decode_modrm(&mut self) -> (u8, Operand) {
        let modrm = parse_mod_rm_byte(self.fetch_u8());
        if modrm.id_mod == 0b11 {
            return (modrm.id_reg, Operand::Register(modrm.id_rm));
        }

        // BP-based modes address the stack segment by default.
        let (base, default_segment) = match modrm.id_rm {
            0b000 => (
                self.regs
                    .get(WordReg::Bx)
                    .wrapping_add(self.regs.get(WordReg::Si)),
                SegReg::Ds,
            ),
            0b001 => (
                self.regs
                    .get(WordReg::Bx)
                    .wrapping_add(self.regs.get(WordReg::Di)),
                SegReg::Ds,
            ),
            0b010 => (
                self.regs
                    .get(WordReg::Bp)
                    .wrapping_add(self.regs.get(WordReg::Si)),
                SegReg::Ss,
            ),
            0b011 => (
                self.regs
                    .get(WordReg::Bp)
                    .wrapping_add(self.regs.get(WordReg::Di)),
                SegReg::Ss,
            ),
            0b100 => (self.regs.get(WordReg::Si), SegReg::Ds),
            0b101 => (self.regs.get(WordReg::Di), SegReg::Ds),
            // mod=00 rm=110 is a bare 16-bit address with no base register
            0b110 if modrm.id_mod == 0b00 => (self.fetch_u16(), SegReg::Ds),
            0b110 => (self.regs.get(WordReg::Bp), SegReg::Ss),
            _ => (self.regs.get(WordReg::Bx), SegReg::Ds),
        };

        let displacement = match modrm.id_mod {
            0b01 => self.fetch_u8() as i8 as u16,
            0b10 => self.fetch_u16(),
            _ => 0,
        };

        // An active override prefix wins over the BP/SS default.
        let segment = self.seg_override.unwrap_or(default_segment);
        (
            modrm.id_reg,
            Operand::Memory {
                segment,
                offset: base.wrapping_add(displacement),
            },
        )
    }

    fn read_operand_byte(&self, operand: Operand) -> u8 {
        match operand {
            Operand::Register(code) => self.regs.get_byte(ByteReg::from_code(code)),
            Operand::Memory { segment, offset } => self.read_mem_byte(segment, offset),
        }
    }

    fn write_operand_byte(&mut self, operand: Operand, value: u8) {
        match operand {
            Operand::Register(code) => self.regs.set_byte(ByteReg::from_code(code), value),
            Operand::Memory { segment, offset } => self.write_mem_byte(segment, offset, value),
        }
    }

    fn read_operand_word(&self, operand: Operand) -> u16 {
        match operand {
            Operand::Register(code) => self.regs.get(WordReg::from_code(code)),
            Operand::Memory { segment, offset } => self.read_mem_word(segment, offset),
        }
    }

    fn write_operand_word(&mut self, operand: Operand, value: u16) {
        match operand {
            Operand::Register(code) => self.regs.set(WordReg::from_code(code), value),
            Operand::Memory { segment, offset } => self.write_mem_word(segment, offset, value),
        }
    }

    // --- stack and interrupts ---

    pub fn push(&mut self, value: u16) {
        let sp = self.regs.get(WordReg::Sp).wrapping_sub(2);
        self.regs.set(WordReg::Sp, sp);
        let addr = physical_address(self.regs.get_seg(SegReg::Ss), sp);
        self.bus.mem_write_word(addr, value);
    }

    pub fn pop(&mut self) -> u16 {
        let sp = self.regs.get(WordReg::Sp);
        let value = self
            .bus
            .mem_read_word(physical_address(self.regs.get_seg(SegReg::Ss), sp));
        self.regs.set(WordReg::Sp, sp.wrapping_add(2));
        value
    }

    /// Interrupt entry: push flags, mask trap/interrupt, push the return
    /// far pointer, then load CS:IP from the vector table.
    pub fn service_interrupt(&mut self, vector: u8) {
        debug!(vector, "servicing interrupt");
        self.push(self.flags.packed_value());
        self.flags.remove(CpuFlags::TRAP | CpuFlags::INTERRUPT);
        self.push(self.regs.get_seg(SegReg::Cs));
        let base = u32::from(vector) * 4;
        let target_cs = self.bus.mem_read_word(base + 2);
        self.regs.set_seg(SegReg::Cs, target_cs);
        self.push(self.ip);
        self.ip = self.bus.mem_read_word(base);
        self.halted = false;
    }

    /// Divide faults are internal interrupt 0; the saved IP addresses the
    /// instruction after the faulting one, as on the 8086/8088.
    fn divide_error(&mut self) {
        self.service_interrupt(0);
    }

    // --- dispatch helpers ---

    fn condition(&self, code: u8) -> bool {
        let taken = match code >> 1 {
            0b000 => self.flags.contains(CpuFlags::OVERFLOW),
            0b001 => self.flags.contains(CpuFlags::CARRY),
            0b010 => self.flags.contains(CpuFlags::ZERO),
            // below-or-equal
            0b011 => self.flags.contains(CpuFlags::CARRY) || self.flags.contains(CpuFlags::ZERO),
            0b100 => self.flags.contains(CpuFlags::SIGN),
            0b101 => self.flags.contains(CpuFlags::PARITY),
            // less: sign and overflow disagree
            0b110 => {
                self.flags.contains(CpuFlags::SIGN) != self.flags.contains(CpuFlags::OVERFLOW)
            }
            // less-or-equal
            _ => {
                self.flags.contains(CpuFlags::ZERO)
                    || self.flags.contains(CpuFlags::SIGN)
                        != self.flags.contains(CpuFlags::OVERFLOW)
            }
        };
        // Odd condition codes are the negated forms.
        taken != (code & 0x01 != 0)
    }

    fn decrement_cx(&mut self) -> u16 {
        let cx = self.regs.get(WordReg::Cx).wrapping_sub(1);
        self.regs.set(WordReg::Cx, cx);
        cx
    }

    fn alu_modrm(&mut self, op: AluOp, width: Width, direction: Direction) {
        let (reg_field, operand) = self.decode_modrm();
        match width {
            Width::Byte => {
                let reg = ByteReg::from_code(reg_field);
                match direction {
                    Direction::RegToRm => {
                        let dest = self.read_operand_byte(operand);
                        let result =
                            operations::alu(op, dest, self.regs.get_byte(reg), &mut self.flags);
                        if op.writes_result() {
                            self.write_operand_byte(operand, result);
                        }
                    }
                    Direction::RmToReg => {
                        let src = self.read_operand_byte(operand);
                        let result =
                            operations::alu(op, self.regs.get_byte(reg), src, &mut self.flags);
                        if op.writes_result() {
                            self.regs.set_byte(reg, result);
                        }
                    }
                }
            }
            Width::Word => {
                let reg = WordReg::from_code(reg_field);
                match direction {
                    Direction::RegToRm => {
                        let dest = self.read_operand_word(operand);
                        let result = operations::alu(op, dest, self.regs.get(reg), &mut self.flags);
                        if op.writes_result() {
                            self.write_operand_word(operand, result);
                        }
                    }
                    Direction::RmToReg => {
                        let src = self.read_operand_word(operand);
                        let result = operations::alu(op, self.regs.get(reg), src, &mut self.flags);
                        if op.writes_result() {
                            self.regs.set(reg, result);
                        }
                    }
                }
            }
        }
    }

    fn alu_acc_imm(&mut self, op: AluOp, width: Width) {
        match width {
            Width::Byte => {
                let imm = self.fetch_u8();
                let result =
                    operations::alu(op, self.regs.get_byte(ByteReg::Al), imm, &mut self.flags);
                if op.writes_result() {
                    self.regs.set_byte(ByteReg::Al, result);
                }
            }
            Width::Word => {
                let imm = self.fetch_u16();
                let result = operations::alu(op, self.regs.get(WordReg::Ax), imm, &mut self.flags);
                if op.writes_result() {
                    self.regs.set(WordReg::Ax, result);
                }
            }
        }
    }

    /// Group 0x80-0x83: ALU op selected by the reg field, immediate operand.
    /// 0x83 sign-extends a byte immediate to word width.
    fn alu_group_imm(&mut self, opcode: u8) {
        let (reg_field, operand) = self.decode_modrm();
        let op = AluOp::from_code(reg_field);
        if opcode & 0x01 == 0 {
            let dest = self.read_operand_byte(operand);
            let imm = self.fetch_u8();
            let result = operations::alu(op, dest, imm, &mut self.flags);
            if op.writes_result() {
                self.write_operand_byte(operand, result);
            }
        } else {
            let dest = self.read_operand_word(operand);
            let imm = if opcode == 0x83 {
                self.fetch_u8() as i8 as u16
            } else {
                self.fetch_u16()
            };
            let result = operations::alu(op, dest, imm, &mut self.flags);
            if op.writes_result() {
                self.write_operand_word(operand, result);
            }
        }
    }

    fn test_modrm(&mut self, width: Width) {
        let (reg_field, operand) = self.decode_modrm();
        match width {
            Width::Byte => {
                let rm = self.read_operand_byte(operand);
                let reg = self.regs.get_byte(ByteReg::from_code(reg_field));
                operations::bitwise_and(rm, reg, &mut self.flags);
            }
            Width::Word => {
                let rm = self.read_operand_word(operand);
                let reg = self.regs.get(WordReg::from_code(reg_field));
                operations::bitwise_and(rm, reg, &mut self.flags);
            }
        }
    }

    fn xchg_modrm(&mut self, width: Width) {
        let (reg_field, operand) = self.decode_modrm();
        match width {
            Width::Byte => {
                let reg = ByteReg::from_code(reg_field);
                let rm = self.read_operand_byte(operand);
                self.write_operand_byte(operand, self.regs.get_byte(reg));
                self.regs.set_byte(reg, rm);
            }
            Width::Word => {
                let reg = WordReg::from_code(reg_field);
                let rm = self.read_operand_word(operand);
                self.write_operand_word(operand, self.regs.get(reg));
                self.regs.set(reg, rm);
            }
        }
    }

    fn mov_modrm(&mut self, width: Width, direction: Direction) {
        let (reg_field, operand) = self.decode_modrm();
        match (width, direction) {
            (Width::Byte, Direction::RegToRm) => {
                let value = self.regs.get_byte(ByteReg::from_code(reg_field));
                self.write_operand_byte(operand, value);
            }
            (Width::Byte, Direction::RmToReg) => {
                let value = self.read_operand_byte(operand);
                self.regs.set_byte(ByteReg::from_code(reg_field), value);
            }
            (Width::Word, Direction::RegToRm) => {
                let value = self.regs.get(WordReg::from_code(reg_field));
                self.write_operand_word(operand, value);
            }
            (Width::Word, Direction::RmToReg) => {
                let value = self.read_operand_word(operand);
                self.regs.set(WordReg::from_code(reg_field), value);
            }
        }
    }

    /// LEA stores the computed offset itself, so a register-direct operand
    /// has nothing to take the address of.
    fn lea(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        let (reg_field, operand) = self.decode_modrm();
        match operand {
            Operand::Memory { offset, .. } => {
                self.regs.set(WordReg::from_code(reg_field), offset);
                Ok(())
            }
            Operand::Register(_) => Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
    }

    /// LES/LDS: register from the first word, segment register from the
    /// second word of a far pointer in memory.
    fn load_far_pointer(
        &mut self,
        seg: SegReg,
        opcode: u8,
        cs: u16,
        ip: u16,
    ) -> Result<(), CpuError> {
        let (reg_field, operand) = self.decode_modrm();
        match operand {
            Operand::Memory { segment, offset } => {
                let value = self.read_mem_word(segment, offset);
                let seg_value = self.read_mem_word(segment, offset.wrapping_add(2));
                self.regs.set(WordReg::from_code(reg_field), value);
                self.regs.set_seg(seg, seg_value);
                Ok(())
            }
            Operand::Register(_) => Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
    }

    fn shift_group(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        let (reg_field, operand) = self.decode_modrm();
        let Some(op) = ShiftOp::from_code(reg_field) else {
            return Err(CpuError::InvalidOpcode { opcode, cs, ip });
        };
        let count = if opcode & 0x02 == 0 {
            1
        } else {
            u32::from(self.regs.get_byte(ByteReg::Cl))
        };
        match Width::from_op(opcode) {
            Width::Byte => {
                let value = self.read_operand_byte(operand);
                let result = operations::shift(op, value, count, &mut self.flags);
                self.write_operand_byte(operand, result);
            }
            Width::Word => {
                let value = self.read_operand_word(operand);
                let result = operations::shift(op, value, count, &mut self.flags);
                self.write_operand_word(operand, result);
            }
        }
        Ok(())
    }

    /// Group 0xF6/0xF7: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV.
    fn group3(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        let width = Width::from_op(opcode);
        let (reg_field, operand) = self.decode_modrm();
        match (reg_field, width) {
            (0b000, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                let imm = self.fetch_u8();
                operations::bitwise_and(value, imm, &mut self.flags);
            }
            (0b000, Width::Word) => {
                let value = self.read_operand_word(operand);
                let imm = self.fetch_u16();
                operations::bitwise_and(value, imm, &mut self.flags);
            }
            (0b010, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                self.write_operand_byte(operand, !value);
            }
            (0b010, Width::Word) => {
                let value = self.read_operand_word(operand);
                self.write_operand_word(operand, !value);
            }
            (0b011, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                let result = operations::neg(value, &mut self.flags);
                self.write_operand_byte(operand, result);
            }
            (0b011, Width::Word) => {
                let value = self.read_operand_word(operand);
                let result = operations::neg(value, &mut self.flags);
                self.write_operand_word(operand, result);
            }
            (0b100, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                self.mul_byte(value);
            }
            (0b100, Width::Word) => {
                let value = self.read_operand_word(operand);
                self.mul_word(value);
            }
            (0b101, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                self.imul_byte(value);
            }
            (0b101, Width::Word) => {
                let value = self.read_operand_word(operand);
                self.imul_word(value);
            }
            (0b110, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                self.div_byte(value);
            }
            (0b110, Width::Word) => {
                let value = self.read_operand_word(operand);
                self.div_word(value);
            }
            (0b111, Width::Byte) => {
                let value = self.read_operand_byte(operand);
                self.idiv_byte(value);
            }
            (0b111, Width::Word) => {
                let value = self.read_operand_word(operand);
                self.idiv_word(value);
            }
            _ => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
        Ok(())
    }

    /// Group 0xFE: INC/DEC on a byte operand.
    fn group4(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        let (reg_field, operand) = self.decode_modrm();
        match reg_field {
            0b000 => {
                let value = self.read_operand_byte(operand);
                let result = operations::inc(value, &mut self.flags);
                self.write_operand_byte(operand, result);
            }
            0b001 => {
                let value = self.read_operand_byte(operand);
                let result = operations::dec(value, &mut self.flags);
                self.write_operand_byte(operand, result);
            }
            _ => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
        Ok(())
    }

    /// Group 0xFF: word INC/DEC, indirect CALL/JMP (near and far), PUSH.
    fn group5(&mut self, opcode: u8, cs: u16, ip: u16) -> Result<(), CpuError> {
        let (reg_field, operand) = self.decode_modrm();
        match reg_field {
            0b000 => {
                let value = self.read_operand_word(operand);
                let result = operations::inc(value, &mut self.flags);
                self.write_operand_word(operand, result);
            }
            0b001 => {
                let value = self.read_operand_word(operand);
                let result = operations::dec(value, &mut self.flags);
                self.write_operand_word(operand, result);
            }
            0b010 => {
                let target = self.read_operand_word(operand);
                self.push(self.ip);
                self.ip = target;
            }
            0b011 => match operand {
                Operand::Memory { segment, offset } => {
                    let target_ip = self.read_mem_word(segment, offset);
                    let target_cs = self.read_mem_word(segment, offset.wrapping_add(2));
                    self.push(self.regs.get_seg(SegReg::Cs));
                    self.push(self.ip);
                    self.regs.set_seg(SegReg::Cs, target_cs);
                    self.ip = target_ip;
                }
                Operand::Register(_) => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
            },
            0b100 => self.ip = self.read_operand_word(operand),
            0b101 => match operand {
                Operand::Memory { segment, offset } => {
                    let target_ip = self.read_mem_word(segment, offset);
                    let target_cs = self.read_mem_word(segment, offset.wrapping_add(2));
                    self.regs.set_seg(SegReg::Cs, target_cs);
                    self.ip = target_ip;
                }
                Operand::Register(_) => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
            },
            0b110 => {
                let value = self.read_operand_word(operand);
                self.push(value);
            }
            _ => return Err(CpuError::InvalidOpcode { opcode, cs, ip }),
        }
        Ok(())
    }

    // --- multiply and divide ---

    fn mul_byte(&mut self, operand: u8) {
        let result = u16::from(self.regs.get_byte(ByteReg::Al)) * u16::from(operand);
        self.regs.set(WordReg::Ax, result);
        let extended = result & 0xFF00 != 0;
        self.flags.set(CpuFlags::CARRY, extended);
        self.flags.set(CpuFlags::OVERFLOW, extended);
    }

    fn mul_word(&mut self, operand: u16) {
        let result = u32::from(self.regs.get(WordReg::Ax)) * u32::from(operand);
        self.regs.set(WordReg::Ax, result as u16);
        self.regs.set(WordReg::Dx, (result >> 16) as u16);
        let extended = result & 0xFFFF_0000 != 0;
        self.flags.set(CpuFlags::CARRY, extended);
        self.flags.set(CpuFlags::OVERFLOW, extended);
    }

    fn imul_byte(&mut self, operand: u8) {
        let al = self.regs.get_byte(ByteReg::Al);
        let result = i16::from(al.cast_signed()) * i16::from(operand.cast_signed());
        self.regs.set(WordReg::Ax, result as u16);
        // AH must be the sign-extension of AL, else the product spilled
        let spilled = result != i16::from((result as u8).cast_signed());
        self.flags.set(CpuFlags::CARRY, spilled);
        self.flags.set(CpuFlags::OVERFLOW, spilled);
    }

    fn imul_word(&mut self, operand: u16) {
        let ax = self.regs.get(WordReg::Ax);
        let result = i32::from(ax.cast_signed()) * i32::from(operand.cast_signed());
        self.regs.set(WordReg::Ax, result as u16);
        self.regs.set(WordReg::Dx, (result >> 16) as u16);
        let spilled = result != i32::from((result as u16).cast_signed());
        self.flags.set(CpuFlags::CARRY, spilled);
        self.flags.set(CpuFlags::OVERFLOW, spilled);
    }

    fn div_byte(&mut self, divisor: u8) {
        let dividend = self.regs.get(WordReg::Ax);
        if divisor == 0 {
            self.divide_error();
            return;
        }
        let quotient = dividend / u16::from(divisor);
        if quotient > 0xFF {
            self.divide_error();
            return;
        }
        let remainder = dividend % u16::from(divisor);
        self.regs.set_byte(ByteReg::Al, quotient as u8);
        self.regs.set_byte(ByteReg::Ah, remainder as u8);
    }

    fn div_word(&mut self, divisor: u16) {
        let dividend =
            u32::from(self.regs.get(WordReg::Dx)) << 16 | u32::from(self.regs.get(WordReg::Ax));
        if divisor == 0 {
            self.divide_error();
            return;
        }
        let quotient = dividend / u32::from(divisor);
        if quotient > 0xFFFF {
            self.divide_error();
            return;
        }
        let remainder = dividend % u32::from(divisor);
        self.regs.set(WordReg::Ax, quotient as u16);
        self.regs.set(WordReg::Dx, remainder as u16);
    }

    /// The remainder takes the dividend's sign; an unrepresentable quotient
    /// faults and leaves AX/DX untouched.
    fn idiv_byte(&mut self, divisor: u8) {
        let dividend = i32::from(self.regs.get(WordReg::Ax).cast_signed());
        let divisor = i32::from(divisor.cast_signed());
        let (Some(quotient), Some(remainder)) =
            (dividend.checked_div(divisor), dividend.checked_rem(divisor))
        else {
            self.divide_error();
            return;
        };
        if !(-0x80..=0x7F).contains(&quotient) {
            self.divide_error();
            return;
        }
        self.regs.set_byte(ByteReg::Al, quotient as u8);
        self.regs.set_byte(ByteReg::Ah, remainder as u8);
    }

    fn idiv_word(&mut self, divisor: u16) {
        let dividend = ((u32::from(self.regs.get(WordReg::Dx)) << 16)
            | u32::from(self.regs.get(WordReg::Ax))) as i32;
        let divisor = i32::from(divisor.cast_signed());
        let (Some(quotient), Some(remainder)) =
            (dividend.checked_div(divisor), dividend.checked_rem(divisor))
        else {
            self.divide_error();
            return;
        };
        if !(-0x8000..=0x7FFF).contains(&quotient) {
            self.divide_error();
            return;
        }
        self.regs.set(WordReg::Ax, quotient as u16);
        self.regs.set(WordReg::Dx, remainder as u16);
    }

    // --- string operations ---

    /// Run a string instruction, honoring an attached repeat prefix. CX is
    /// decremented before each iteration, so CX=0 on entry runs nothing.
    fn string_instruction(&mut self, op: StringOp, width: Width) {
        match std::mem::take(&mut self.rep) {
            RepPrefix::None => self.string_step(op, width),
            rep => {
                while self.regs.get(WordReg::Cx) != 0 {
                    self.decrement_cx();
                    self.string_step(op, width);
                    if op.compares() {
                        let zero = self.flags.contains(CpuFlags::ZERO);
                        let done = match rep {
                            RepPrefix::WhileEqual => !zero,
                            RepPrefix::WhileNotEqual => zero,
                            RepPrefix::None => true,
                        };
                        if done {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn string_step(&mut self, op: StringOp, width: Width) {
        // Only the SI side honors a segment override; the DI side is
        // hardwired to ES.
        let src_segment = self.seg_override.unwrap_or(SegReg::Ds);
        let si = self.regs.get(WordReg::Si);
        let di = self.regs.get(WordReg::Di);
        match op {
            StringOp::Movs => {
                match width {
                    Width::Byte => {
                        let value = self.read_mem_byte(src_segment, si);
                        self.write_mem_byte(SegReg::Es, di, value);
                    }
                    Width::Word => {
                        let value = self.read_mem_word(src_segment, si);
                        self.write_mem_word(SegReg::Es, di, value);
                    }
                }
                self.advance_index(WordReg::Si, width);
                self.advance_index(WordReg::Di, width);
            }
            StringOp::Lods => {
                match width {
                    Width::Byte => {
                        let value = self.read_mem_byte(src_segment, si);
                        self.regs.set_byte(ByteReg::Al, value);
                    }
                    Width::Word => {
                        let value = self.read_mem_word(src_segment, si);
                        self.regs.set(WordReg::Ax, value);
                    }
                }
                self.advance_index(WordReg::Si, width);
            }
            StringOp::Stos => {
                match width {
                    Width::Byte => {
                        let value = self.regs.get_byte(ByteReg::Al);
                        self.write_mem_byte(SegReg::Es, di, value);
                    }
                    Width::Word => {
                        let value = self.regs.get(WordReg::Ax);
                        self.write_mem_word(SegReg::Es, di, value);
                    }
                }
                self.advance_index(WordReg::Di, width);
            }
            StringOp::Scas => {
                match width {
                    Width::Byte => {
                        let value = self.read_mem_byte(SegReg::Es, di);
                        operations::sub(self.regs.get_byte(ByteReg::Al), value, &mut self.flags);
                    }
                    Width::Word => {
                        let value = self.read_mem_word(SegReg::Es, di);
                        operations::sub(self.regs.get(WordReg::Ax), value, &mut self.flags);
                    }
                }
                self.advance_index(WordReg::Di, width);
            }
            StringOp::Cmps => {
                match width {
                    Width::Byte => {
                        let src = self.read_mem_byte(src_segment, si);
                        let dst = self.read_mem_byte(SegReg::Es, di);
                        operations::sub(src, dst, &mut self.flags);
                    }
                    Width::Word => {
                        let src = self.read_mem_word(src_segment, si);
                        let dst = self.read_mem_word(SegReg::Es, di);
                        operations::sub(src, dst, &mut self.flags);
                    }
                }
                self.advance_index(WordReg::Si, width);
                self.advance_index(WordReg::Di, width);
            }
        }
    }

    fn advance_index(&mut self, reg: WordReg, width: Width) {
        let value = self.regs.get(reg);
        let next = if self.flags.contains(CpuFlags::DIRECTION) {
            value.wrapping_sub(width.bytes())
        } else {
            value.wrapping_add(width.bytes())
        };
        self.regs.set(reg, next);
    }

    // --- port I/O ---

    fn input_byte(&mut self, port: u16) {
        let value = self.bus.io_read_byte(port);
        self.regs.set_byte(ByteReg::Al, value);
    }

    /// The data bus is byte-wide, so word I/O is two successive port cycles.
    fn input_word(&mut self, port: u16) {
        let low = self.bus.io_read_byte(port);
        let high = self.bus.io_read_byte(port.wrapping_add(1));
        self.regs.set(WordReg::Ax, u16::from_le_bytes([low, high]));
    }

    fn output_byte(&mut self, port: u16) {
        let value = self.regs.get_byte(ByteReg::Al);
        self.bus.io_write_byte(port, value);
    }

    fn output_word(&mut self, port: u16) {
        let bytes = self.regs.get(WordReg::Ax).to_le_bytes();
        self.bus.io_write_byte(port, bytes[0]);
        self.bus.io_write_byte(port.wrapping_add(1), bytes[1]);
    }

    // --- BCD adjust ---

    fn daa(&mut self) {
        let al = self.regs.get_byte(ByteReg::Al);
        let old_carry = self.flags.contains(CpuFlags::CARRY);
        let mut result = al;
        let mut carry = false;
        if al & 0x0F > 9 || self.flags.contains(CpuFlags::AUX_CARRY) {
            result = result.wrapping_add(0x06);
            carry = old_carry || al > 0xF9;
            self.flags.insert(CpuFlags::AUX_CARRY);
        } else {
            self.flags.remove(CpuFlags::AUX_CARRY);
        }
        if al > 0x99 || old_carry {
            result = result.wrapping_add(0x60);
            carry = true;
        }
        self.regs.set_byte(ByteReg::Al, result);
        self.flags.set(CpuFlags::CARRY, carry);
        self.flags
            .set_from_result(u32::from(result), Width::Byte, false);
    }

    fn das(&mut self) {
        let al = self.regs.get_byte(ByteReg::Al);
        let old_carry = self.flags.contains(CpuFlags::CARRY);
        let mut result = al;
        let mut carry = false;
        if al & 0x0F > 9 || self.flags.contains(CpuFlags::AUX_CARRY) {
            result = result.wrapping_sub(0x06);
            carry = old_carry || al < 0x06;
            self.flags.insert(CpuFlags::AUX_CARRY);
        } else {
            self.flags.remove(CpuFlags::AUX_CARRY);
        }
        if al > 0x99 || old_carry {
            result = result.wrapping_sub(0x60);
            carry = true;
        }
        self.regs.set_byte(ByteReg::Al, result);
        self.flags.set(CpuFlags::CARRY, carry);
        self.flags
            .set_from_result(u32::from(result), Width::Byte, false);
    }

    fn aaa(&mut self) {
        let al = self.regs.get_byte(ByteReg::Al);
        if al & 0x0F > 9 || self.flags.contains(CpuFlags::AUX_CARRY) {
            let ax = self.regs.get(WordReg::Ax).wrapping_add(0x106);
            self.regs.set(WordReg::Ax, ax);
            self.flags.insert(CpuFlags::AUX_CARRY | CpuFlags::CARRY);
        } else {
            self.flags.remove(CpuFlags::AUX_CARRY | CpuFlags::CARRY);
        }
        let masked = self.regs.get_byte(ByteReg::Al) & 0x0F;
        self.regs.set_byte(ByteReg::Al, masked);
    }

    fn aas(&mut self) {
        let al = self.regs.get_byte(ByteReg::Al);
        if al & 0x0F > 9 || self.flags.contains(CpuFlags::AUX_CARRY) {
            let ax = self.regs.get(WordReg::Ax).wrapping_sub(0x106);
            self.regs.set(WordReg::Ax, ax);
            self.flags.insert(CpuFlags::AUX_CARRY | CpuFlags::CARRY);
        } else {
            self.flags.remove(CpuFlags::AUX_CARRY | CpuFlags::CARRY);
        }
        let masked = self.regs.get_byte(ByteReg::Al) & 0x0F;
        self.regs.set_byte(ByteReg::Al, masked);
    }

    /// AAM divides AL by an arbitrary base (0x0A as encoded), so a zero base
    /// raises the divide fault.
    fn aam(&mut self, base: u8) {
        if base == 0 {
            self.divide_error();
            return;
        }
        let al = self.regs.get_byte(ByteReg::Al);
        self.regs.set_byte(ByteReg::Ah, al / base);
        let al = al % base;
        self.regs.set_byte(ByteReg::Al, al);
        self.flags.set_from_result(u32::from(al), Width::Byte, false);
    }

    fn aad(&mut self, base: u8) {
        let al = self.regs.get_byte(ByteReg::Al);
        let ah = self.regs.get_byte(ByteReg::Ah);
        let al = al.wrapping_add(ah.wrapping_mul(base));
        self.regs.set_byte(ByteReg::Al, al);
        self.regs.set_byte(ByteReg::Ah, 0);
        self.flags.set_from_result(u32::from(al), Width::Byte, false);
    }
}

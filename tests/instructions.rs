use rx88::bus::{Bus, FlatMemory};
use rx88::cpu::Cpu;
use rx88::registers::{SegReg, WordReg};
use serde::Deserialize;
use test_log::test;
use tracing::debug_span;

#[derive(Deserialize, Debug)]
struct TestRegisters {
    ax: Option<u16>,
    bx: Option<u16>,
    cx: Option<u16>,
    dx: Option<u16>,
    si: Option<u16>,
    di: Option<u16>,
    bp: Option<u16>,
    sp: Option<u16>,
    ip: Option<u16>,
    cs: Option<u16>,
    ds: Option<u16>,
    ss: Option<u16>,
    es: Option<u16>,
    /// Packed FLAGS image, reserved bits included.
    flags: Option<u16>,
}

#[derive(Deserialize, Debug)]
struct TestState {
    regs: TestRegisters,
    #[serde(default)]
    ram: Vec<(u32, u8)>,
}

#[derive(Deserialize, Debug)]
struct InstructionTestCase {
    name: String,
    initial: TestState,
    #[serde(rename = "final")]
    final_state: TestState,
    idx: u64,
}

fn set_cpu_state(cpu: &mut Cpu<FlatMemory>, test_case: &InstructionTestCase) {
    // test cases always define every register for the initial state
    let regs = &test_case.initial.regs;
    cpu.regs.set(WordReg::Ax, regs.ax.unwrap());
    cpu.regs.set(WordReg::Bx, regs.bx.unwrap());
    cpu.regs.set(WordReg::Cx, regs.cx.unwrap());
    cpu.regs.set(WordReg::Dx, regs.dx.unwrap());
    cpu.regs.set(WordReg::Si, regs.si.unwrap());
    cpu.regs.set(WordReg::Di, regs.di.unwrap());
    cpu.regs.set(WordReg::Bp, regs.bp.unwrap());
    cpu.regs.set(WordReg::Sp, regs.sp.unwrap());
    cpu.ip = regs.ip.unwrap();
    cpu.regs.set_seg(SegReg::Cs, regs.cs.unwrap());
    cpu.regs.set_seg(SegReg::Ds, regs.ds.unwrap());
    cpu.regs.set_seg(SegReg::Ss, regs.ss.unwrap());
    cpu.regs.set_seg(SegReg::Es, regs.es.unwrap());
    cpu.flags.set_packed(regs.flags.unwrap());

    for (addr, value) in &test_case.initial.ram {
        cpu.bus_mut().mem_write_byte(*addr, *value);
    }
}

fn assert_matches_expected<T>(
    test_case: &InstructionTestCase,
    value_name: &str,
    current: T,
    expected: Option<T>,
) where
    T: std::fmt::Debug + PartialEq,
{
    if let Some(expected) = expected {
        assert_eq!(
            current, expected,
            "{} ({}): unexpected {} value",
            test_case.name, test_case.idx, value_name
        );
    }
}

fn check_cpu_state(cpu: &Cpu<FlatMemory>, test_case: &InstructionTestCase) {
    let regs = &test_case.final_state.regs;
    assert_matches_expected(test_case, "ax", cpu.regs.get(WordReg::Ax), regs.ax);
    assert_matches_expected(test_case, "bx", cpu.regs.get(WordReg::Bx), regs.bx);
    assert_matches_expected(test_case, "cx", cpu.regs.get(WordReg::Cx), regs.cx);
    assert_matches_expected(test_case, "dx", cpu.regs.get(WordReg::Dx), regs.dx);
    assert_matches_expected(test_case, "si", cpu.regs.get(WordReg::Si), regs.si);
    assert_matches_expected(test_case, "di", cpu.regs.get(WordReg::Di), regs.di);
    assert_matches_expected(test_case, "bp", cpu.regs.get(WordReg::Bp), regs.bp);
    assert_matches_expected(test_case, "sp", cpu.regs.get(WordReg::Sp), regs.sp);
    assert_matches_expected(test_case, "ip", cpu.ip, regs.ip);
    assert_matches_expected(test_case, "cs", cpu.regs.get_seg(SegReg::Cs), regs.cs);
    assert_matches_expected(test_case, "ds", cpu.regs.get_seg(SegReg::Ds), regs.ds);
    assert_matches_expected(test_case, "ss", cpu.regs.get_seg(SegReg::Ss), regs.ss);
    assert_matches_expected(test_case, "es", cpu.regs.get_seg(SegReg::Es), regs.es);
    assert_matches_expected(test_case, "flags", cpu.flags.packed_value(), regs.flags);

    for (addr, value) in &test_case.final_state.ram {
        assert_eq!(
            cpu.bus().mem_read_byte(*addr),
            *value,
            "{} ({}): unexpected ram value at {:#07X}",
            test_case.name,
            test_case.idx,
            addr
        );
    }
}

fn run_instruction_test_case(path: &str) {
    let test_json = std::fs::read_to_string(path).unwrap();
    let test_cases: Vec<InstructionTestCase> = serde_json::from_str(&test_json).unwrap();
    for test_case in &test_cases {
        let _span = debug_span!("case", idx = test_case.idx, name = %test_case.name).entered();
        let mut cpu = Cpu::new(FlatMemory::new());
        set_cpu_state(&mut cpu, test_case);
        cpu.fetch().unwrap();
        check_cpu_state(&cpu, test_case);
    }
}

instruction_test_generator::generate_instruction_tests!("tests/instructions_cases");

use std::env;

use tracing::error;

use rx88::bus::FlatMemory;
use rx88::cpu::Cpu;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        println!("usage: {} <input_program>", args[0]);
        return Ok(());
    }

    let image = std::fs::read(&args[1])?;
    let mut memory = FlatMemory::new();
    memory.load(0, &image);
    // The reset vector far-jumps to the image loaded at 0000:0000.
    memory.load(0xFFFF0, &[0xEA, 0x00, 0x00, 0x00, 0x00]);

    let mut cpu = Cpu::new(memory);
    loop {
        if let Err(err) = cpu.fetch() {
            error!("{err}");
            break;
        }
        if cpu.is_halted() {
            break;
        }
    }
    cpu.dump_registers();
    Ok(())
}

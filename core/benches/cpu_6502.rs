use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_core::cpu_6502::{Cpu6502, Memory6502};

/// Flat 64K memory for benchmarking; side-effect-free so the instruction cache
/// stays warm across the whole loop.
struct BenchMemory {
    ram: Vec<u8>,
    dirty: [bool; 256],
}

impl BenchMemory {
    fn new() -> Self {
        let mut ram = vec![0; 0x10000];

        ram[0xFFFC] = 0x00;
        ram[0xFFFD] = 0x80;

        // LDA #$42 ; STA $2000 ; LDX #$10 ; LDY #$20 ; INX ; INY ; DEX ; DEY ; ADC #$01 ; JMP $8000
        let program: &[u8] = &[
            0xA9, 0x42, 0x8D, 0x00, 0x20, 0xA2, 0x10, 0xA0, 0x20, 0xE8, 0xC8, 0xCA, 0x88, 0x69,
            0x01, 0x4C, 0x00, 0x80,
        ];
        ram[0x8000..0x8000 + program.len()].copy_from_slice(program);

        Self { ram, dirty: [false; 256] }
    }
}

#[derive(Debug)]
struct Never;

impl Memory6502 for BenchMemory {
    type Fault = Never;

    fn read(&mut self, addr: u16) -> Result<u8, Never> {
        Ok(self.ram[addr as usize])
    }

    fn write(&mut self, addr: u16, val: u8) -> Result<(), Never> {
        self.ram[addr as usize] = val;
        self.dirty[(addr >> 8) as usize] = true;
        Ok(())
    }

    fn has_side_effect(&self, _addr: u16) -> bool {
        false
    }

    fn is_dirty_page(&self, addr: u16) -> bool {
        self.dirty[(addr >> 8) as usize]
    }

    fn mark_page_clean(&mut self, addr: u16) {
        self.dirty[(addr >> 8) as usize] = false;
    }
}

fn bench_cpu_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_6502_step");

    group.bench_function("single_instruction", |b| {
        b.iter(|| {
            let mut cpu = Cpu6502::new(BenchMemory::new());
            cpu.reset().unwrap();
            cpu.step().unwrap();
            black_box(cpu.a);
        });
    });

    group.finish();
}

fn bench_cpu_multiple_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_6502_multiple_steps");

    for step_count in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(step_count),
            step_count,
            |b, &count| {
                b.iter(|| {
                    let mut cpu = Cpu6502::new(BenchMemory::new());
                    cpu.reset().unwrap();
                    for _ in 0..count {
                        cpu.step().unwrap();
                    }
                    black_box(cpu.cycle);
                });
            },
        );
    }

    group.finish();
}

fn bench_cpu_cache_warm_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_6502_cache_warm_loop");

    // The program above loops through 0x8000..0x8011 repeatedly, so after the
    // first pass every step hits the decoded-instruction cache.
    group.bench_function("hundred_iterations", |b| {
        b.iter(|| {
            let mut cpu = Cpu6502::new(BenchMemory::new());
            cpu.reset().unwrap();
            for _ in 0..1000 {
                cpu.step().unwrap();
            }
            black_box(cpu.a);
        });
    });

    group.finish();
}

fn bench_cpu_reset(c: &mut Criterion) {
    c.bench_function("cpu_6502_reset", |b| {
        let mut cpu = Cpu6502::new(BenchMemory::new());
        b.iter(|| {
            cpu.reset().unwrap();
            black_box(cpu.pc);
        });
    });
}

criterion_group!(
    benches,
    bench_cpu_step,
    bench_cpu_multiple_steps,
    bench_cpu_cache_warm_loop,
    bench_cpu_reset
);
criterion_main!(benches);

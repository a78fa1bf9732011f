//! Entrypoint for CLI
mod conf;
mod error;

use std::{env, error::Error, fs, time::Instant};

use chip8::{prelude::*, Clock, IMPL_VERSION};
use log::{debug, error, info, warn};

use self::{
    conf::{CliConf, InputEvent},
    error::AppError,
};

static USAGE: &str = r#"
usage: chip8 CMD FILE [OPTIONS]

commands:
    run     Run the target ROM file and print the final display
    dis     Disassemble the target ROM into readable assembly

options:
    --steps N         Stop after N steps
    --config FILE     Load run settings from a YAML file

examples:
    chip8 run breakout.rom --steps 5000
    chip8 run breakout.rom --config breakout.yaml
    chip8 dis breakout.rom
"#;

fn run_bytecode(filepath: &str, conf: CliConf) -> Result<(), AppError> {
    info!("load rom: {filepath}");

    let bytecode = fs::read(filepath)?;
    let inputs = conf.input_events()?;

    let mut vm = Chip8Vm::new(conf.vm.clone());
    vm.load_bytecode(bytecode.as_slice())?;

    let clock = conf.clock_frequency().map(Clock::new);

    let start = Instant::now();
    let summary = run_vm(&mut vm, &inputs, conf.steps, clock);
    let end = Instant::now();

    info!(
        "{} steps, {} draws, time taken: {}ms",
        summary.steps,
        summary.frames,
        end.duration_since(start).as_nanos() as f64 / 1000000.0
    ); // to millis
    println!("{}", vm.dump_display()?);

    if let Stop::Error(err) = summary.stop {
        error!("{err}");
        println!("{}", vm.dump_ram(16)?);
        return Err(err.into());
    }

    Ok(())
}

/// Why the run loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Stop {
    /// Step limit reached.
    StepLimit,
    /// Program is waiting for a key, and no more input is scripted.
    KeyWait,
    Error(ExecutionError),
}

#[derive(Debug)]
struct RunSummary {
    /// Successfully executed steps.
    steps: usize,
    /// Steps that changed the display.
    frames: usize,
    /// Times the buzzer switched on or off.
    buzzer_toggles: usize,
    stop: Stop,
}

/// Step the VM until the step limit, a stall on key input, or an error.
///
/// Scripted input is applied before the step it is scheduled for.
fn run_vm(
    vm: &mut Chip8Vm,
    inputs: &[InputEvent],
    max_steps: Option<usize>,
    mut clock: Option<Clock>,
) -> RunSummary {
    let mut pending = inputs.iter().peekable();
    let mut buzzer_state = vm.is_sound_active();
    let mut steps = 0_usize;
    let mut frames = 0_usize;
    let mut buzzer_toggles = 0_usize;

    let stop = loop {
        if max_steps.map(|max| steps >= max).unwrap_or(false) {
            break Stop::StepLimit;
        }

        // Merge scripted input into VM
        while let Some(input) = pending.next_if(|input| input.step <= steps) {
            debug!("step {steps}: {} {}", input.key, input.pressed);
            vm.set_key(input.key, input.pressed);
        }

        if let Some(clock) = clock.as_mut() {
            clock.wait();
        }

        let flow = match vm.tick() {
            Ok(flow) => flow,
            Err(err) => break Stop::Error(err),
        };
        steps += 1;

        // Buzzer should be on while sound timer counts down,
        // then turned off when the timer reaches zero.
        if vm.is_sound_active() != buzzer_state {
            buzzer_state = vm.is_sound_active();
            buzzer_toggles += 1;
            info!("buzzer {}", if buzzer_state { "on" } else { "off" });
        }

        match flow {
            Flow::Draw => frames += 1,
            Flow::KeyWait if pending.peek().is_none() => {
                // Nothing will ever press a key.
                info!("program is waiting for a key press, stopping");
                break Stop::KeyWait;
            }
            _ => {}
        }
    };

    RunSummary {
        steps,
        frames,
        buzzer_toggles,
        stop,
    }
}

fn run_disassembler(filepath: &str) -> Result<(), AppError> {
    info!("disassemble rom: {filepath}");

    let bytecode = fs::read(filepath)?;
    if bytecode.len() % 2 != 0 {
        warn!("rom has an odd number of bytes");
    }

    Disassembler::new(bytecode.as_slice()).print_bytecode()?;

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::SimpleLogger::new().env().init()?;

    match parse_args(env::args().skip(1)) {
        Some(Cmd::Run {
            filepath,
            steps,
            config,
        }) => {
            let mut conf = match config {
                Some(path) => CliConf::from_file(&path)?,
                None => CliConf::default(),
            };
            // Command line takes precedence over the config file.
            if steps.is_some() {
                conf.steps = steps;
            }
            run_bytecode(&filepath, conf)?
        }
        Some(Cmd::Dis { filepath }) => run_disassembler(&filepath)?,
        None => {
            print_usage();
            // FreeBSD EX_USAGE (64)
            std::process::exit(64)
        }
    }

    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Cmd> {
    let cmd = args.next()?;
    let filepath = args.next()?;

    match cmd.as_str() {
        "run" => {
            let mut steps = None;
            let mut config = None;

            while let Some(opt) = args.next() {
                match opt.as_str() {
                    "--steps" => steps = Some(args.next()?.parse().ok()?),
                    "--config" => config = Some(args.next()?),
                    _ => return None,
                }
            }

            Some(Cmd::Run {
                filepath,
                steps,
                config,
            })
        }
        "dis" => Some(Cmd::Dis { filepath }),
        _ => None,
    }
}

fn print_usage() {
    println!("Chip8 v{IMPL_VERSION}");
    println!("{USAGE}");
}

#[derive(Debug, PartialEq, Eq)]
enum Cmd {
    /// Run file
    Run {
        filepath: String,
        steps: Option<usize>,
        config: Option<String>,
    },
    /// Disassemble
    Dis { filepath: String },
}

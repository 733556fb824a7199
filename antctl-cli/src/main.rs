// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Operator console: a line-oriented REPL posting commands to the control
//! core, plus an optional sampler thread appending periodic status dumps
//! to a file.

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use antctl::{Axis, Control, ControlOpts, SystemStatus};

#[derive(Parser)]
#[command(name = "antctl", about = "Operator console for the antenna drive system")]
struct Args {
    /// Path to the drive parameter file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short = 'l', long = "loglevel", default_value = "warn")]
    loglevel: LevelFilter,

    /// Append periodic status samples to this file.
    #[arg(short = 'f', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Sample period for --logfile [microseconds].
    #[arg(short = 'r', long = "lograte", default_value_t = 100_000)]
    lograte: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let debug = matches!(args.loglevel, LevelFilter::Debug | LevelFilter::Trace);
    let logdir: Option<String> = None;
    mlzlog::init(
        logdir,
        "antctl",
        mlzlog::Settings {
            show_appname: false,
            debug,
            use_stdout: true,
            ..Default::default()
        },
    )
    .context("cannot set up logging")?;
    log::set_max_level(args.loglevel);

    let control = Control::new(&args.config, ControlOpts::default())
        .context("drive system initialization failed")?;
    let control = Arc::new(control);

    let stop = Arc::new(AtomicBool::new(false));
    let sampler = args.logfile.as_ref().map(|path| {
        let control = Arc::clone(&control);
        let stop = Arc::clone(&stop);
        let path = path.clone();
        let period = Duration::from_micros(args.lograte.max(1));
        thread::spawn(move || sample_loop(&control, &stop, &path, period))
    });

    eprintln!("Please, specify your commands here:");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.trim();
        match line {
            "" => continue,
            "q" => break,
            "h" | "help" => {
                print_help();
                continue;
            }
            "s" => {
                print_status(&control.status());
                continue;
            }
            "i" => {
                print_info(&control);
                continue;
            }
            _ => {}
        }
        match parse_command(line) {
            Some(cmd) => dispatch(&control, cmd),
            None => eprintln!("Invalid input, 'h' lists the available commands"),
        }
    }

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = sampler {
        let _ = handle.join();
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Scan(Axis, i32),
    Point(Axis, i32),
    Idle(Axis),
}

fn parse_command(line: &str) -> Option<Command> {
    let mut tokens = line.split_whitespace();
    let axis = match tokens.next()? {
        "a" => Axis::Azimuth,
        "e" => Axis::Elevation,
        _ => return None,
    };
    match tokens.next()? {
        "v" => tokens.next()?.parse().ok().map(|v| Command::Scan(axis, v)),
        "p" => tokens.next()?.parse().ok().map(|p| Command::Point(axis, p)),
        "i" => Some(Command::Idle(axis)),
        _ => None,
    }
}

fn dispatch(control: &Control, cmd: Command) {
    match cmd {
        Command::Scan(axis, vel) => {
            control.run_scan(axis, vel);
            eprintln!("Command {axis} scan vel: {vel}");
        }
        Command::Point(axis, pos) => {
            control.run_point(axis, pos);
            eprintln!("Command {axis} point pos: {pos}");
        }
        Command::Idle(axis) => {
            // Idle doubles as fault acknowledgement.
            control.reset_fault(axis);
            eprintln!("Command {axis} idle");
        }
    }
}

fn print_help() {
    eprintln!("Available commands:");
    eprintln!("    h, help      - print this message");
    eprintln!("    q            - quit");
    eprintln!("    s            - print system status");
    eprintln!("    i            - print system info");
    eprintln!("    a|e v <vel>  - scan (a)zimuth or (e)levation at <vel> [pulses/s]");
    eprintln!("    a|e p <pos>  - position (a)zimuth or (e)levation to <pos> [pulses]");
    eprintln!("    a|e i        - idle (a)zimuth or (e)levation, clearing any fault");
}

fn print_status(status: &SystemStatus) {
    eprintln!(
        "System > state: {:?} missed: {} invalid: {} dcsync: {}ns",
        status.state, status.missed_cycles, status.invalid_intents, status.dcsync
    );
    for (axis, st) in Axis::ALL.iter().zip(status.axes.iter()) {
        eprintln!(
            "Axis {axis} > state: {:?} statusword: {:#06x} ctrlword: {:#06x} mode: {:?} \
             cur_pos: {} tgt_pos: {} dmd_pos: {} cur_vel: {} tgt_vel: {} dmd_vel: {} \
             cur_trq: {} cur_tmp: {}",
            st.state,
            st.statusword,
            st.controlword,
            st.mode,
            st.cur_pos,
            st.tgt_pos,
            st.dmd_pos,
            st.cur_vel,
            st.tgt_vel,
            st.dmd_vel,
            st.cur_torque,
            st.temperatures[0],
        );
    }
}

fn print_info(control: &Control) {
    for (axis, info) in Axis::ALL.iter().zip(control.info().axes.iter()) {
        eprintln!(
            "Axis {axis} > dev_name: {} encoder_resolution: {} hw_version: {} sw_version: {}",
            info.dev_name, info.encoder_pulses_per_rev, info.hw_version, info.sw_version
        );
    }
}

/// Sampler thread: one column-formatted line per period.
fn sample_loop(control: &Control, stop: &AtomicBool, path: &PathBuf, period: Duration) {
    let file = match File::create(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file {}: {e}", path.display());
            return;
        }
    };
    let mut out = BufWriter::new(file);
    let _ = writeln!(
        out,
        "1.AppTime | 2.StateA | 3.StatusWordA | 4.ControlWordA | 5.ModeA | 6.CurPosA | \
         7.TgtPosA | 8.DmdPosA | 9.CurVelA | 10.TgtVelA | 11.DmdVelA | 12.CurTrqA | 13.CurTempA | \
         14.StateE | 15.StatusWordE | 16.ControlWordE | 17.ModeE | 18.CurPosE | 19.TgtPosE | \
         20.DmdPosE | 21.CurVelE | 22.TgtVelE | 23.DmdVelE | 24.CurTrqE | 25.CurTempE"
    );

    while !stop.load(Ordering::Relaxed) {
        let status = control.status();
        let mut line = format!("{}", status.apptime);
        for st in &status.axes {
            line.push_str(&format!(
                "\t{:?}\t{:#06x}\t{:#06x}\t{:?}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                st.state,
                st.statusword,
                st.controlword,
                st.mode,
                st.cur_pos,
                st.tgt_pos,
                st.dmd_pos,
                st.cur_vel,
                st.tgt_vel,
                st.dmd_vel,
                st.cur_torque,
                st.temperatures[0],
            ));
        }
        let _ = writeln!(out, "{line}");
        thread::sleep(period);
    }
    let _ = out.flush();
}

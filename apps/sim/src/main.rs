//! # RoArm 设备循环模拟器
//!
//! 在模拟舵机总线上运行设备端的单线程协作式循环：
//! 标准输入的每一行 JSON 指令在两拍之间处理，回复写到标准输出，日志写到标准错误。
//!
//! ```bash
//! $ roarm-sim --unit deg
//! {"T":220,"cmd":1}
//! drag 2 30
//! {"T":105}
//! {"T":1051,"unit":"deg","b":0.0,"s":29.97,"e":0.0,"t":0.0}
//! {"T":220,"cmd":0}
//! ```
//!
//! 额外的模拟指令：
//! - `drag <joint> <deg>`：模拟用户把关节拖到指定角度
//! - `power-cycle`：模拟断电重启（随后重新自检）

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, TryRecvError};
use roarm_driver::mock::MockServoBus;
use roarm_sdk::prelude::*;
use roarm_sdk::protocol::TICKS_PER_REV;
use tracing::{info, warn};

/// RoArm 拖动示教模拟器
#[derive(Parser, Debug)]
#[command(name = "roarm-sim")]
#[command(about = "Drag-teach device loop on a simulated servo bus", long_about = None)]
#[command(version)]
struct Args {
    /// 机械臂配置文件（TOML），缺省使用默认布局
    #[arg(long)]
    config: Option<PathBuf>,

    /// 位置反馈单位
    #[arg(long, value_enum, default_value_t = UnitArg::Deg)]
    unit: UnitArg,

    /// 启动前把这些舵机的工作模式破坏为开环 PWM
    #[arg(long, value_delimiter = ',')]
    corrupt: Vec<ServoId>,

    /// 运行指定拍数后退出
    #[arg(long)]
    max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UnitArg {
    Deg,
    Rad,
}

impl From<UnitArg> for AngleUnit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::Deg => AngleUnit::Deg,
            UnitArg::Rad => AngleUnit::Rad,
        }
    }
}

/// 输入线程送来的一行
#[derive(Debug)]
enum Input {
    Command(String),
    Drag { joint: JointId, angle: Deg },
    PowerCycle,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "power-cycle" {
        return Some(Input::PowerCycle);
    }
    if let Some(rest) = line.strip_prefix("drag ") {
        let mut parts = rest.split_whitespace();
        let joint = parts
            .next()
            .and_then(|j| j.parse::<u8>().ok())
            .and_then(|j| JointId::try_from(j).ok());
        let angle = parts.next().and_then(|a| a.parse::<f64>().ok());
        return match (joint, angle) {
            (Some(joint), Some(angle)) => Some(Input::Drag {
                joint,
                angle: Deg(angle),
            }),
            _ => {
                warn!("Usage: drag <joint 1-4> <degrees>");
                None
            },
        };
    }
    Some(Input::Command(line.to_string()))
}

/// 专用输入线程：阻塞读取标准输入，主循环只做非阻塞接收
fn spawn_input_thread() -> Receiver<Input> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Some(input) = parse_input(&line)
                && tx.send(input).is_err()
            {
                break;
            }
        }
    });
    rx
}

/// 模拟用户拖动关节（镜像关节两路舵机同时移动）
fn drag(bus: &MockServoBus, dispatcher: &Dispatcher<MockServoBus>, joint: JointId, angle: Deg) {
    let group = match dispatcher.arm().joint(joint) {
        Ok(group) => group,
        Err(e) => {
            warn!("Cannot drag joint {}: {}", joint, e);
            return;
        },
    };
    let max = TICKS_PER_REV as i32 - 1;
    let middle = group.middle() as i32;
    let offset = angle.to_tick_offset();
    bus.set_position(group.driving(), (middle + offset).clamp(0, max) as u16);
    if let Some(driven) = group.driven() {
        bus.set_position(driven, (middle - offset).clamp(0, max) as u16);
    }
    info!("Joint {} dragged to {}", joint, angle);
}

fn reply(line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn boot(dispatcher: &mut Dispatcher<MockServoBus>) -> Result<()> {
    let report = dispatcher.arm_mut().boot().context("boot diagnostics failed")?;
    if report.repairs.is_empty() {
        info!("Boot check passed for {} servos", report.checked.len());
    } else {
        warn!("Boot repaired {} servos: {:?}", report.repairs.len(), report.repairs);
    }
    Ok(())
}

fn main() -> Result<()> {
    roarm_sdk::init_logger();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ArmConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ArmConfig::default(),
    };

    let servo_ids: Vec<ServoId> = config
        .joints
        .iter()
        .flat_map(|j| std::iter::once(j.driving).chain(j.driven))
        .collect();
    let bus = MockServoBus::with_register_map(servo_ids, config.family.register_map());
    for &servo in &args.corrupt {
        bus.corrupt_mode(servo, 2);
    }

    let mut dispatcher =
        Dispatcher::new(bus.clone(), &config)?.with_report_unit(args.unit.into());
    boot(&mut dispatcher)?;

    // Ctrl+C 走正常退出路径：先恢复满力矩再结束
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("failed to set signal handler")?;

    let input = spawn_input_thread();
    let tick = config.drag_teach.tick();
    let mut next_tick = Instant::now();
    let mut ticks: u64 = 0;
    let mut shutting_down = false;
    info!("Simulator running, tick {:?}", tick);

    loop {
        let now = Instant::now();

        // 两拍之间处理全部已到达的输入
        loop {
            match input.try_recv() {
                Ok(Input::Command(line)) => match dispatcher.handle_line(&line, now) {
                    Ok(Some(response)) => reply(&response),
                    Ok(None) => {},
                    Err(e) => warn!("Command {} rejected: {}", line, e),
                },
                Ok(Input::Drag { joint, angle }) => drag(&bus, &dispatcher, joint, angle),
                Ok(Input::PowerCycle) => {
                    info!("Simulated power cycle");
                    bus.power_cycle();
                    boot(&mut dispatcher)?;
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    shutting_down = true;
                    break;
                },
            }
        }

        if !running.load(Ordering::SeqCst) || args.max_ticks.is_some_and(|max| ticks >= max) {
            shutting_down = true;
        }
        if shutting_down
            && dispatcher.is_drag_teach_active()
            && !dispatcher.session().exit_pending()
        {
            dispatcher.handle(HostCommand::DragTeach { enter: false }, now)?;
        }

        if let Err(e) = dispatcher.tick(now) {
            warn!("Tick {} failed: {}", ticks, e);
        }
        for event in dispatcher.drain_events() {
            info!("Drag-teach event: {:?}", event);
        }
        ticks += 1;

        if shutting_down && !dispatcher.is_drag_teach_active() {
            break;
        }

        next_tick += tick;
        spin_sleep::sleep(next_tick.saturating_duration_since(Instant::now()));
    }

    info!(
        "Simulator stopped after {} ticks, {} persistent writes",
        ticks,
        dispatcher.arm().access().persistent_writes().len()
    );
    Ok(())
}

//! Command parsing and response formatting for the interactive client.
//! Deliberately minimal: whitespace tokenizing only, no quoting or escapes.

use batchd::jobs::JobStatus;
use batchd::proto::Frame;

pub enum Command {
    Submit {
        maxcpu: u32,
        maxmem: u32,
        priority: i32,
        cmd: String,
    },
    Status(u32),
    Signal(u32, u32),
    SetPri(u32, i32),
    Stdout(u32),
    Stderr(u32),
    ListAll,
    Expunge(u32),
    Quit,
}

/// Parses one REPL input line. Returns `Err(message)` for a recognised
/// command with bad arguments, `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let word = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    let bad = |usage: &str| Err(format!("usage: {usage}"));

    let cmd = match word {
        "submit" => {
            let mut fields = rest.splitn(4, char::is_whitespace);
            let (Some(maxcpu), Some(maxmem), Some(priority), Some(cmd)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return bad("submit <maxcpu> <maxmem> <priority> <cmd...>");
            };
            Command::Submit {
                maxcpu: maxcpu.parse().map_err(|_| "maxcpu must be a number".to_string())?,
                maxmem: maxmem.parse().map_err(|_| "maxmem must be a number".to_string())?,
                priority: priority.parse().map_err(|_| "priority must be a number".to_string())?,
                cmd: cmd.to_string(),
            }
        },
        "status" => Command::Status(parse_jobid(rest)?),
        "signal" => {
            let mut fields = rest.split_whitespace();
            let (Some(jobid), Some(signum)) = (fields.next(), fields.next()) else {
                return bad("signal <jobid> <signum>");
            };
            Command::Signal(
                jobid.parse().map_err(|_| "bad jobid".to_string())?,
                signum.parse().map_err(|_| "bad signum".to_string())?,
            )
        },
        "setpri" => {
            let mut fields = rest.split_whitespace();
            let (Some(jobid), Some(priority)) = (fields.next(), fields.next()) else {
                return bad("setpri <jobid> <priority>");
            };
            Command::SetPri(
                jobid.parse().map_err(|_| "bad jobid".to_string())?,
                priority.parse().map_err(|_| "bad priority".to_string())?,
            )
        },
        "stdout" => Command::Stdout(parse_jobid(rest)?),
        "stderr" => Command::Stderr(parse_jobid(rest)?),
        "list" => Command::ListAll,
        "expunge" => Command::Expunge(parse_jobid(rest)?),
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command {other:?}")),
    };
    Ok(Some(cmd))
}

fn parse_jobid(s: &str) -> Result<u32, String> {
    s.trim().parse().map_err(|_| "expected a jobid".to_string())
}

pub fn to_frame(cmd: Command) -> Option<Frame> {
    Some(match cmd {
        Command::Submit {
            maxcpu,
            maxmem,
            priority,
            cmd,
        } => Frame::JobSubmit {
            maxcpu,
            maxmem,
            priority,
            cmd: cmd.into_bytes(),
            envp: std::env::vars()
                .map(|(k, v)| format!("{k}={v}").into_bytes())
                .collect(),
        },
        Command::Status(jobid) => Frame::JobStatus { jobid },
        Command::Signal(jobid, signum) => Frame::JobSignal { jobid, signum },
        Command::SetPri(jobid, priority) => Frame::JobSetPri { jobid, priority },
        Command::Stdout(jobid) => Frame::JobGetStdout { jobid },
        Command::Stderr(jobid) => Frame::JobGetStderr { jobid },
        Command::ListAll => Frame::JobListAll,
        Command::Expunge(jobid) => Frame::JobExpunge { jobid },
        Command::Quit => return None,
    })
}

/// Renders a frame received from the server the way a user should see it.
pub fn print_frame(frame: &Frame) {
    match frame {
        Frame::Ack => println!("OK"),
        Frame::Nack => println!("No such job found"),
        Frame::JobSubmitSuccess { jobid } => println!("Job submitted ({jobid})"),
        Frame::JobUpdate { jobid, status } => {
            let status = JobStatus::from_wire_code(*status)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            println!("[{jobid}] Changed state and is now '{status}'");
        },
        Frame::JobStatusResp {
            status,
            exitcode,
            maxcpu,
            maxmem,
            priority,
            rusage,
        } => {
            let status = JobStatus::from_wire_code(*status)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            let cpu_secs = rusage.utime_secs + rusage.stime_secs;
            println!(
                "status={status} exit={exitcode} maxcpu={maxcpu} maxmem={maxmem} priority={priority} cputime={cpu_secs}s maxrss={}kB",
                rusage.maxrss_kb
            );
        },
        Frame::JobListAllResp { listing } => {
            for rec in listing {
                let status = JobStatus::from_wire_code(rec.status)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                println!(
                    "{}: {} [{status}] exit={}",
                    rec.jobid,
                    String::from_utf8_lossy(&rec.cmd),
                    rec.exitcode
                );
            }
        },
        Frame::JobResults { content } => {
            use std::io::Write;
            let _ = std::io::stdout().write_all(content);
        },
        other => println!("unexpected server frame: {other:?}"),
    }
}

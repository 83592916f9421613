//! rfbridge: std host
//!
//! Reads NDJSON commands from stdin and writes NDJSON replies to stdout.
//! Thread-based: the main thread reads lines, a command thread dispatches
//! them onto the bridge, and an output thread owns stdout. Threads are joined
//! by bounded `std::sync::mpsc` channels, so a slow consumer applies
//! backpressure to the reader.
//!
//! Log output goes to stderr; set `RUST_LOG` to change the level.

use std::io::{self, BufRead, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use rfbridge::comm::{parse_command, OutputLine};
use rfbridge::protocol::HostCommand;
use rfbridge::{defaults, BatchTranslator, Bridge, ChipsetRegistry, LineReader};
use rfbridge::{TranslationEngine, VERSION};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("rfbridge v{} starting (std host)", VERSION);

    let registry = ChipsetRegistry::with_stock_chipsets();
    log::info!(
        "Catalogue loaded: {} stock chipsets ({})",
        registry.len(),
        registry.model_ids().join(", ")
    );
    log::debug!(
        "Protocol fallback order: {:?}",
        defaults::PROTOCOL_PRIORITY
    );

    let bridge = Bridge::new(registry, BatchTranslator::new(TranslationEngine::new()));

    // ── Channels ─────────────────────────────────────────────────────

    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(16);
    let (output_tx, output_rx) = mpsc::sync_channel::<OutputLine>(64);

    // ── Output thread ────────────────────────────────────────────────

    let output = thread::Builder::new()
        .name("output".into())
        .spawn(move || output_thread(output_rx))?;
    log::debug!("Output thread spawned");

    // ── Command thread ───────────────────────────────────────────────

    let command = thread::Builder::new()
        .name("command".into())
        .spawn(move || command_thread(bridge, cmd_rx, output_tx))?;
    log::debug!("Command thread spawned");

    // ── Input loop (main thread) ─────────────────────────────────────

    let stdin = io::stdin();
    let read = input_loop(stdin.lock(), &cmd_tx);
    drop(cmd_tx);

    let commands = command
        .join()
        .map_err(|_| anyhow::anyhow!("command thread panicked"))?;
    output
        .join()
        .map_err(|_| anyhow::anyhow!("output thread panicked"))??;

    let lines = read?;
    log::info!("Input closed after {} lines, {} commands handled", lines, commands);
    Ok(())
}

// ── Input ────────────────────────────────────────────────────────────

/// Feed stdin through the line reader until EOF or until the command thread
/// hangs up. Returns the number of complete lines seen.
fn input_loop(mut input: impl BufRead, cmd_tx: &SyncSender<HostCommand>) -> io::Result<u64> {
    let mut reader = LineReader::new();
    let mut chunk = [0u8; 1024];
    let mut lines = 0u64;

    loop {
        let n = match input.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for &byte in &chunk[..n] {
            let Some(line) = reader.feed(byte) else {
                continue;
            };
            lines += 1;
            match parse_command(line) {
                Some(cmd) => {
                    if cmd_tx.send(cmd).is_err() {
                        log::warn!("Command thread gone, stopping input");
                        return Ok(lines);
                    }
                }
                None => log::debug!("Line {} ignored", lines),
            }
        }
    }

    // A final command without a trailing newline still counts.
    if let Some(line) = reader.feed(b'\n') {
        lines += 1;
        if let Some(cmd) = parse_command(line) {
            let _ = cmd_tx.send(cmd);
        }
    }
    Ok(lines)
}

// ── Command thread ───────────────────────────────────────────────────

fn command_thread(
    bridge: Bridge,
    cmd_rx: Receiver<HostCommand>,
    output_tx: SyncSender<OutputLine>,
) -> u64 {
    let mut handled = 0u64;
    while let Ok(cmd) = cmd_rx.recv() {
        handled += 1;
        for line in bridge.handle_command(cmd) {
            if output_tx.send(line).is_err() {
                log::error!("Output thread gone, dropping replies");
                return handled;
            }
        }
    }
    handled
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: Receiver<OutputLine>) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    while let Ok(line) = output_rx.recv() {
        out.write_all(&line)?;
        // Flush per reply so interactive hosts see answers immediately.
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> (u64, Vec<HostCommand>) {
        let (tx, rx) = mpsc::sync_channel(64);
        let lines = input_loop(input.as_bytes(), &tx).unwrap();
        drop(tx);
        (lines, rx.iter().collect())
    }

    #[test]
    fn reads_commands_until_eof() {
        let (lines, cmds) = run("{\"cmd\":\"status\"}\n{\"cmd\":\"status\"}\n");
        assert_eq!(lines, 2);
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn skips_bad_lines() {
        let (lines, cmds) = run("garbage\n\n{\"cmd\":\"status\"}\n");
        assert_eq!(lines, 2);
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn final_line_without_newline() {
        let (_, cmds) = run("{\"cmd\":\"status\"}");
        assert!(matches!(cmds.as_slice(), [HostCommand::GetStatus]));
    }

    #[test]
    fn command_thread_replies_per_command() {
        let (cmd_tx, cmd_rx) = mpsc::sync_channel(4);
        let (out_tx, out_rx) = mpsc::sync_channel(16);
        cmd_tx.send(HostCommand::GetStatus).unwrap();
        drop(cmd_tx);

        let bridge = Bridge::new(ChipsetRegistry::with_stock_chipsets(), BatchTranslator::default());
        assert_eq!(command_thread(bridge, cmd_rx, out_tx), 1);

        let replies: Vec<OutputLine> = out_rx.iter().collect();
        assert_eq!(replies.len(), 1);
        let text = String::from_utf8(replies[0].clone()).unwrap();
        assert!(text.contains("\"type\":\"status\""));
        assert!(text.contains("\"chipsets\":6"));
        assert!(text.ends_with('\n'));
    }
}

const DEFAULT_STATS_LIMIT: usize = 20;

fn main() {
    if handle_cli_flags() {
        return;
    }

    if let Err(err) = fsub_gate::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut saw_flag = false;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fsub-gate {}", fsub_gate::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "fsub-gate: force-subscribe file gate bot for Telegram.\n\n  --version, -V          Show version and exit\n  --help,    -h          Show this help message\n  --skip-stats [N]       Print the N most skipped channels and exit"
                );
                saw_flag = true;
            }
            "--skip-stats" => {
                saw_flag = true;
                let limit = iter
                    .next_if(|next| !next.starts_with('-'))
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_STATS_LIMIT);
                if let Err(err) = print_skip_stats(limit) {
                    eprintln!("Reading skip stats failed: {err:?}");
                    std::process::exit(1);
                }
            }
            _ => {}
        }
    }
    saw_flag
}

fn print_skip_stats(limit: usize) -> anyhow::Result<()> {
    let counters = fsub_gate::app::skip_stats(limit)?;
    if counters.is_empty() {
        println!("No skips recorded yet.");
        return Ok(());
    }
    for (rank, counter) in counters.iter().enumerate() {
        println!("{:>3}. {:<40} {}", rank + 1, counter.check_handle, counter.skips);
    }
    Ok(())
}

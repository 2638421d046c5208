//! ZIM transport CLI
//!
//! Sends a captured migration payload over the configured medium, or
//! restores one on the target machine.

use clap::Parser;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;
use zim_transport::config::{parse_size, CliArgs, Commands, TransportConfig, TransportMethod};
use zim_transport::error::{IoResultExt, Result, TransportError};
use zim_transport::fs::{copy_with_progress, reassemble, split_file, TransferContext};
use zim_transport::hash::hash_file;
use zim_transport::progress::TransferProgress;
use zim_transport::sync::{relative_components, ItemType, MigrationItem, TransferManifest, TransferMetadata};
use zim_transport::transport::{estimate_transfer_time, open_transport, Transport};

fn main() {
    let args = CliArgs::parse();

    let level = if args.quiet {
        LevelFilter::ERROR
    } else {
        match args.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    // RUST_LOG still wins over --verbose
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
        .with_target(false)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    handle_command(&args.command, &args)
}

fn handle_command(command: &Commands, args: &CliArgs) -> Result<()> {
    match command {
        Commands::Estimate { size } => cmd_estimate(size),
        Commands::Split { file, out_dir, chunk_size } => cmd_split(file, out_dir, chunk_size),
        Commands::Join { output, parts } => cmd_join(output, parts, args),
        Commands::Probe => cmd_probe(&load_config(args)?),
        Commands::Send { source } => cmd_send(source, &load_config(args)?, args),
        Commands::Receive { destination } => cmd_receive(destination, &load_config(args)?, args),
        Commands::Status => cmd_status(&load_config(args)?),
    }
}

fn load_config(args: &CliArgs) -> Result<TransportConfig> {
    TransportConfig::from_cli(args).map_err(TransportError::Config)
}

fn context(config: &TransportConfig) -> TransferContext {
    TransferContext::new().with_buffer_size(config.buffer_size)
}

fn progress_for(args: &CliArgs) -> TransferProgress {
    if args.progress && !args.quiet {
        TransferProgress::new()
    } else {
        TransferProgress::disabled()
    }
}

fn cmd_probe(config: &TransportConfig) -> Result<()> {
    let transport = open_transport(config)?;
    let ok = transport.test_connection(&context(config));
    transport.close()?;

    if ok {
        println!("{} at {:?} is reachable", config.method.name(), config.root);
        Ok(())
    } else {
        Err(TransportError::connection(
            config.method.name(),
            "probe failed; run with -v for details",
        ))
    }
}

/// One file found under the source directory
struct SourceFile {
    path: PathBuf,
    relative_path: String,
    size: u64,
}

fn collect_source(source: &Path) -> Result<Vec<SourceFile>> {
    if !source.is_dir() {
        return Err(TransportError::NotFound(source.display().to_string()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            TransportError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| TransportError::InvalidPath(entry.path().display().to_string()))?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map_err(|e| TransportError::io(entry.path(), e.into()))?
            .len();

        files.push(SourceFile {
            path: entry.path().to_path_buf(),
            relative_path,
            size,
        });
    }
    Ok(files)
}

fn build_manifest(method: TransportMethod, files: &[SourceFile]) -> TransferManifest {
    let mut manifest = TransferManifest::for_this_host(method);
    for file in files {
        manifest.add_item(MigrationItem::new(&file.relative_path, ItemType::File, file.size as i64));
    }
    manifest
}

fn cmd_send(source: &Path, config: &TransportConfig, args: &CliArgs) -> Result<()> {
    let files = collect_source(source)?;
    let manifest = build_manifest(config.method, &files);
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    info!("Sending {} file(s) from {:?}", files.len(), source);

    #[cfg(feature = "ssh")]
    {
        let sessions = config.remote.as_ref().map(|r| r.sessions).unwrap_or(1);
        if config.method == TransportMethod::Sftp && sessions != 1 {
            return send_parallel(&files, &manifest, config, args);
        }
    }

    let ctx = context(config);
    let transport = open_transport(config)?;
    let progress = progress_for(args);
    progress.set_totals(files.len() as u64, total_bytes);

    transport.send_manifest(&ctx, &manifest)?;
    let already = transport.completed_transfers(&ctx).unwrap_or_default();

    let mut sent = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for file in &files {
        match send_one(transport.as_ref(), &ctx, file, &already, &progress) {
            Ok(true) => skipped += 1,
            Ok(false) => sent += 1,
            Err(e) if e.is_recoverable() => {
                warn!("'{}' failed: {}", file.relative_path, e);
                failed += 1;
            }
            Err(e) => {
                progress.finish_error(&e.to_string());
                let _ = transport.close();
                return Err(e.with_context(format!("sending '{}'", file.relative_path)));
            }
        }
    }
    transport.close()?;

    finish(&progress, sent, skipped, failed, args)
}

/// Send one file; `Ok(true)` when the ledger already had it
fn send_one(
    transport: &dyn Transport,
    ctx: &TransferContext,
    file: &SourceFile,
    already: &HashSet<String>,
    progress: &TransferProgress,
) -> Result<bool> {
    let mut meta = TransferMetadata::new(&file.relative_path, file.size as i64).with_checksum(hash_file(&file.path)?);
    let mut reader = BufReader::new(File::open(&file.path).with_path(&file.path)?);

    progress.begin_item(&file.relative_path);
    let reported = AtomicU64::new(0);
    let report = |n: u64| {
        reported.store(n, Ordering::Relaxed);
        progress.update_item(n);
    };
    transport.send(ctx, &mut reader, &mut meta, Some(&report))?;

    let skipped = already.contains(&file.relative_path) && reported.load(Ordering::Relaxed) == 0;
    progress.update_item(file.size);
    progress.finish_item();
    Ok(skipped)
}

#[cfg(feature = "ssh")]
fn send_parallel(
    files: &[SourceFile],
    manifest: &TransferManifest,
    config: &TransportConfig,
    args: &CliArgs,
) -> Result<()> {
    use zim_transport::network::ParallelSftpSender;

    let ctx = context(config);
    let sender = ParallelSftpSender::from_config(config)?;
    let progress = progress_for(args);
    progress.set_totals(files.len() as u64, files.iter().map(|f| f.size).sum());
    progress.begin_item(&format!("{} file(s) over {} sessions", files.len(), sender.sessions()));

    sender.primary().send_manifest(&ctx, manifest)?;

    let items = files
        .iter()
        .map(|f| {
            let meta = TransferMetadata::new(&f.relative_path, f.size as i64).with_checksum(hash_file(&f.path)?);
            Ok((f.path.clone(), meta))
        })
        .collect::<Result<Vec<_>>>()?;

    let report = |n: u64| progress.update_item(n);
    let results = sender.send_batch(&ctx, &items, Some(&report));
    sender.close()?;

    let mut failed = 0usize;
    for ((_, meta), result) in items.iter().zip(&results) {
        if let Err(e) = result {
            if let TransportError::Cancelled = e {
                return Err(TransportError::Cancelled);
            }
            warn!("'{}' failed: {}", meta.relative_path, e);
            failed += 1;
        }
    }
    finish(&progress, results.len() - failed, 0, failed, args)
}

fn finish(progress: &TransferProgress, done: usize, skipped: usize, failed: usize, args: &CliArgs) -> Result<()> {
    let message = format!("{} transferred, {} already delivered, {} failed", done, skipped, failed);
    if failed > 0 {
        progress.finish_error(&message);
    } else {
        progress.finish_success(&message);
    }

    if !args.quiet {
        println!("{}", message);
        progress.summary().print();
    }

    if failed > 0 {
        eprintln!("{} item(s) failed; rerun to resume", failed);
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_receive(destination: &Path, config: &TransportConfig, args: &CliArgs) -> Result<()> {
    let ctx = context(config);
    let transport = open_transport(config)?;

    let manifest = transport.receive_manifest(&ctx)?;
    if !args.quiet {
        manifest.print_summary();
    }

    let selected: Vec<&MigrationItem> = manifest.selected_items().collect();
    let progress = progress_for(args);
    progress.set_totals(selected.len() as u64, manifest.total_estimated_size());

    std::fs::create_dir_all(destination).with_path(destination)?;

    let mut received = 0usize;
    let mut failed = 0usize;
    for item in selected {
        let meta = TransferMetadata::new(&item.display_name, item.estimated_size_bytes);
        match receive_one(transport.as_ref(), &ctx, &meta, destination, &progress) {
            Ok(()) => received += 1,
            Err(e) if e.is_recoverable() || e.is_not_found() => {
                warn!("'{}' not restored: {}", item.display_name, e);
                failed += 1;
            }
            Err(e) => {
                progress.finish_error(&e.to_string());
                let _ = transport.close();
                return Err(e.with_context(format!("restoring '{}'", item.display_name)));
            }
        }
    }
    transport.close()?;

    finish(&progress, received, 0, failed, args)
}

fn receive_one(
    transport: &dyn Transport,
    ctx: &TransferContext,
    meta: &TransferMetadata,
    destination: &Path,
    progress: &TransferProgress,
) -> Result<()> {
    let target = relative_components(&meta.relative_path)?
        .into_iter()
        .fold(destination.to_path_buf(), |path, c| path.join(c));
    let parent = target.parent().unwrap_or(destination);
    std::fs::create_dir_all(parent).with_path(parent)?;

    progress.begin_item(&meta.relative_path);
    let mut reader = transport.receive(ctx, meta)?;

    // Checksum failures surface at EOF, before the rename
    let staged = tempfile::NamedTempFile::new_in(parent).with_path(parent)?;
    {
        let mut writer = BufWriter::new(staged.as_file());
        let report = |n: u64| progress.update_item(n);
        copy_with_progress(ctx, &mut reader, &mut writer, Some(&report))?;
    }
    staged
        .persist(&target)
        .map_err(|e| TransportError::io(&target, e.error))?;

    progress.finish_item();
    info!("Restored {:?}", target);
    Ok(())
}

fn cmd_status(config: &TransportConfig) -> Result<()> {
    let transport = open_transport(config)?;
    let mut completed: Vec<String> = transport.completed_transfers(&context(config))?.into_iter().collect();
    transport.close()?;
    completed.sort();

    println!("=== Completed transfers ({}) ===", config.method.name());
    if completed.is_empty() {
        println!("(none)");
    }
    for path in &completed {
        println!("  {}", path);
    }
    println!("\nTotal: {}", completed.len());
    Ok(())
}

fn cmd_estimate(size: &str) -> Result<()> {
    let bytes = parse_size(size).map_err(TransportError::Config)?;
    let estimate = estimate_transfer_time(bytes);

    println!(
        "{} over Bluetooth: about {}",
        humansize::format_size(bytes, humansize::BINARY),
        humantime::format_duration(Duration::from_secs(estimate.as_secs().max(1)))
    );
    Ok(())
}

fn cmd_split(file: &Path, out_dir: &Path, chunk_size: &str) -> Result<()> {
    let chunk_size = parse_size(chunk_size).map_err(TransportError::Config)?;
    std::fs::create_dir_all(out_dir).with_path(out_dir)?;

    let parts = split_file(file, out_dir, chunk_size)?;
    println!("Wrote {} chunk(s) to {:?}", parts.len(), out_dir);
    for part in &parts {
        println!("  {}", part.display());
    }
    Ok(())
}

fn cmd_join(output: &Path, parts: &[PathBuf], args: &CliArgs) -> Result<()> {
    let mut reader = reassemble(parts)?;
    let total = reader.total_len()?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staged = tempfile::NamedTempFile::new_in(parent).with_path(parent)?;
    {
        let mut writer = BufWriter::new(staged.as_file());
        copy_with_progress(&TransferContext::new(), &mut reader, &mut writer, None)?;
    }
    staged
        .persist(output)
        .map_err(|e| TransportError::io(output, e.error))?;

    if !args.quiet {
        println!(
            "Joined {} chunk(s) into {:?} ({})",
            parts.len(),
            output,
            humansize::format_size(total, humansize::BINARY)
        );
    }
    Ok(())
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CLI tool for inspecting a store file.

use clap::{Parser, Subcommand};
use dpm_store::{Dict, DictKind, Heap, HeapOpenMode, Ref, Table};
use humansize::{SizeFormatter, BINARY};
use rustyline::DefaultEditor;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};
    ($msg:literal) => {{
        eprintln!($msg);
        std::process::exit(1);
    }};
}

/// CLI tool for inspecting a `dpm-store` heap file.
#[derive(Parser, Debug)]
#[command(name = "store")]
#[command(about = "CLI tool for inspecting a dpm-store heap file")]
struct ToolArgs {
    /// Path to the heap file (created if it doesn't exist and `--write` is
    /// passed).
    store_path: PathBuf,

    /// Open for writing (required for `gc` and `intern`). Defaults to
    /// read-only.
    #[arg(short, long)]
    write: bool,

    /// Command to run (if omitted, starts an interactive shell).
    #[command(subcommand)]
    command: Option<ToolCommand>,
}

#[derive(Subcommand, Debug, Clone)]
enum ToolCommand {
    /// Print the heap header: format version, used bytes, root.
    Info,
    /// Dump the object at the root reference.
    Root,
    /// List every blob interned in the table at a given field of the root
    /// record (0 if the root *is* the table).
    Table {
        /// Field index of the root record holding the table, or omit if the
        /// root itself is the table.
        field: Option<u32>,
    },
    /// List every entry of a STRONG/WEAK_KEYS dict at a given field of the
    /// root record.
    Dict {
        /// Field index of the root record holding the dict.
        field: u32,
        /// Dict flavor: "strong", "weak-keys", or "weak-sets".
        kind: String,
    },
    /// Run a garbage collection, compacting the heap in place.
    Gc,
}

fn parse_kind(s: &str) -> Option<DictKind> {
    match s {
        "strong" => Some(DictKind::Strong),
        "weak-keys" => Some(DictKind::WeakKeys),
        "weak-sets" => Some(DictKind::WeakSets),
        _ => None,
    }
}

fn print_value(heap: &Heap, r: Ref) {
    if r.is_nil() {
        println!("nil");
    } else if r.is_immediate() {
        println!("{}", r.to_int());
    } else if heap.is_blob(r) {
        let bytes = heap.blob_bytes(r);
        match std::str::from_utf8(&bytes) {
            Ok(s) => println!("blob[{}] {s:?}", bytes.len()),
            Err(_) => println!("blob[{}] {bytes:?}", bytes.len()),
        }
    } else {
        println!("record(tag={}, len={})", heap.tag(r), heap.len(r));
    }
}

fn handle_info(heap: &Heap) {
    println!("used_bytes: {}", SizeFormatter::new(heap.used_bytes(), BINARY));
    let root = heap.get_root().unwrap_or(Ref::NIL);
    print!("root: ");
    print_value(heap, root);
}

fn handle_root(heap: &Heap) {
    let root = heap.get_root().unwrap_or(Ref::NIL);
    if root.is_nil() {
        println!("(nil root)");
        return;
    }
    if heap.is_record(root) {
        for i in 0..heap.len(root) {
            print!("  [{i}] ");
            print_value(heap, heap.field(root, i));
        }
    } else {
        print_value(heap, root);
    }
}

fn resolve_field(heap: &Heap, field: Option<u32>) -> Ref {
    let root = heap.get_root().unwrap_or(Ref::NIL);
    match field {
        Some(i) => heap.field(root, i),
        None => root,
    }
}

fn handle_table(heap: &Heap, field: Option<u32>) {
    let table_root = resolve_field(heap, field);
    let table = Table::init(heap, table_root);
    let mut count = 0;
    for r in table.iter_entries() {
        print_value(heap, r);
        count += 1;
    }
    println!("({count} interned entries)");
}

fn handle_dict(heap: &Heap, field: u32, kind: &str) {
    let Some(kind) = parse_kind(kind) else {
        eprintln!("unknown dict kind {kind:?} (want strong, weak-keys, or weak-sets)");
        return;
    };

    let dict_root = resolve_field(heap, Some(field));
    let dict = Dict::init(heap, dict_root, kind);

    let entries = match dict.iter_entries() {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("error reading dict: {e}");
            return;
        }
    };

    for (k, v) in &entries {
        print!("  ");
        print_value(heap, *k);
        print!("    -> ");
        print_value(heap, *v);
    }
    println!("({} entries)", entries.len());
}

fn handle_gc(heap: &Heap) {
    match heap.gc() {
        Ok(()) => println!("OK (compacted)"),
        Err(e) => eprintln!("gc failed: {e}"),
    }
}

enum CommandResult {
    Continue,
    Exit,
}

fn execute_command(heap: &Heap, cmd: ToolCommand) -> CommandResult {
    match cmd {
        ToolCommand::Info => handle_info(heap),
        ToolCommand::Root => handle_root(heap),
        ToolCommand::Table { field } => handle_table(heap, field),
        ToolCommand::Dict { field, kind } => handle_dict(heap, field, &kind),
        ToolCommand::Gc => handle_gc(heap),
    }
    CommandResult::Continue
}

#[derive(Parser, Debug)]
#[command(name = "")]
#[command(no_binary_name = true)]
#[command(disable_version_flag = true)]
struct ShellArgs {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ShellCommand {
    #[command(flatten)]
    ToolCmd(ToolCommand),
    /// Exit the shell.
    #[command(visible_alias = "quit")]
    Exit,
}

fn run_shell_command(heap: &Heap, line: &str) -> CommandResult {
    let line = line.trim();
    if line.is_empty() {
        return CommandResult::Continue;
    }

    let tokens = match shlex::split(line) {
        Some(t) if !t.is_empty() => t,
        Some(_) => return CommandResult::Continue,
        None => {
            eprintln!("error: unclosed quote");
            return CommandResult::Continue;
        }
    };

    match ShellArgs::try_parse_from(&tokens) {
        Ok(args) => match args.command {
            ShellCommand::ToolCmd(cmd) => execute_command(heap, cmd),
            ShellCommand::Exit => CommandResult::Exit,
        },
        Err(e) => {
            eprintln!("{e}");
            CommandResult::Continue
        }
    }
}

fn run_shell(heap: &Heap) {
    if io::stdin().is_terminal() {
        run_shell_interactive(heap);
    } else {
        run_shell_non_interactive(heap);
    }
}

fn run_shell_interactive(heap: &Heap) {
    println!("dpm-store shell. Type 'help' for commands, 'exit' to quit.\n");

    let mut rl = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("error initializing line editor: {e}");
            return;
        }
    };

    loop {
        match rl.readline("store> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                if let CommandResult::Exit = run_shell_command(heap, &line) {
                    break;
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(e) => {
                eprintln!("error reading input: {e}");
                break;
            }
        }
    }
}

fn run_shell_non_interactive(heap: &Heap) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if stdout.flush().is_err() {
            die!("can't flush stdout");
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if let CommandResult::Exit = run_shell_command(heap, &line) {
                    break;
                }
            }
            Err(e) => die!("error reading input: {e}"),
        }
    }
}

fn main() {
    let args = ToolArgs::parse();

    let mode = if args.write {
        if args.store_path.exists() {
            HeapOpenMode::Write
        } else {
            HeapOpenMode::Trunc
        }
    } else {
        HeapOpenMode::Read
    };

    let heap = match Heap::open(&args.store_path, mode) {
        Ok(h) => h,
        Err(e) => die!("Can't open {}: {e}", args.store_path.display()),
    };

    match args.command {
        Some(cmd) => {
            execute_command(&heap, cmd);
        }
        None => run_shell(&heap),
    }
}

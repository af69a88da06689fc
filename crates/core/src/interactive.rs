//! Interactive-command signatures.
//!
//! A command is interactive when it is explicitly flagged, or when its program
//! is a shell, REPL, editor, remote session or interactive database client that
//! is started without a script to run.

/// Programs that are interactive whatever their arguments.
const ALWAYS_INTERACTIVE: &[&str] = &[
    // editors and pagers
    "vim", "vi", "nvim", "nano", "emacs", "pico", "micro", "less", "more", "top", "htop",
    // remote sessions
    "ssh", "telnet", "mosh", "ftp", "sftp",
    // interactive database clients
    "mysql", "psql", "sqlite3", "mongo", "mongosh", "redis-cli", "cqlsh", "sqlcmd",
    // chat-style assistants
    "claude", "aider", "ollama",
];

/// Shells and REPLs: interactive unless given something to run.
const REPLS: &[&str] = &[
    "sh", "bash", "zsh", "fish", "dash", "ksh", "pwsh", "powershell", "cmd", "python",
    "python3", "ipython", "node", "deno", "irb", "ruby", "ghci", "lua", "php", "R", "julia",
];

/// Arguments that mean "run this and exit" for a REPL.
const SCRIPT_FLAGS: &[&str] = &["-c", "-e", "--eval", "-m", "/c", "-Command", "-File", "--version", "-V"];

/// Arguments that force interactivity whatever the program.
const INTERACTIVE_FLAGS: &[&str] = &["-i", "--interactive", "-it", "-ti"];

/// Whether `command` (a shell line) looks like it needs live input.
pub fn is_interactive_command(command: &str) -> bool {
    let mut words = command.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    let args: Vec<&str> = words.collect();
    let program = program_name(first);

    if ALWAYS_INTERACTIVE.contains(&program) {
        return true;
    }
    if args.iter().any(|a| INTERACTIVE_FLAGS.contains(a)) {
        return true;
    }
    if REPLS.contains(&program) {
        return !args
            .iter()
            .any(|a| SCRIPT_FLAGS.contains(a) || looks_like_script(a));
    }
    false
}

/// Combine the explicit flag with signature detection.
pub fn needs_interaction(flagged: bool, command: &str) -> bool {
    flagged || is_interactive_command(command)
}

fn program_name(word: &str) -> &str {
    let base = word.rsplit(['/', '\\']).next().unwrap_or(word);
    base.strip_suffix(".exe").unwrap_or(base)
}

fn looks_like_script(arg: &str) -> bool {
    !arg.starts_with('-')
        && [".sh", ".py", ".js", ".ts", ".rb", ".lua", ".php", ".ps1", ".R", ".jl"]
            .iter()
            .any(|ext| arg.ends_with(ext))
}

//! Kernel command line.
//!
//! GRUB hands us one line via the Multiboot2 command-line tag. Options come
//! first (`-o mlfqs` is the only recognised one); the remaining words name a
//! user program and its arguments, executed once the kernel is up.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootOptions {
    /// `-o mlfqs`: use the multi-level feedback queue scheduler.
    pub mlfqs: bool,
    /// Program name + argv to run after boot, empty if none was given.
    pub run: Vec<String>,
}

pub fn parse(cmdline: &str) -> BootOptions {
    let mut opts = BootOptions::default();
    let mut words = cmdline.split_whitespace().peekable();

    while let Some(&word) = words.peek() {
        match word {
            "-o" => {
                words.next();
                match words.next() {
                    Some("mlfqs") => opts.mlfqs = true,
                    Some(other) => crate::log_warn!("cmdline: unknown option -o {}", other),
                    None => crate::log_warn!("cmdline: -o requires an argument"),
                }
            }
            _ => break,
        }
    }

    opts.run = words.map(|w| w.to_string()).collect();
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test_case]
    fn empty_line() {
        let opts = parse("");
        assert!(!opts.mlfqs);
        assert!(opts.run.is_empty());
    }

    #[test_case]
    fn mlfqs_flag() {
        let opts = parse("-o mlfqs");
        assert!(opts.mlfqs);
        assert!(opts.run.is_empty());
    }

    #[test_case]
    fn program_with_args() {
        let opts = parse("echo hello world");
        assert!(!opts.mlfqs);
        assert_eq!(opts.run, vec!["echo", "hello", "world"]);
    }

    #[test_case]
    fn option_then_program() {
        let opts = parse("  -o mlfqs  mmap-shuffle 7 ");
        assert!(opts.mlfqs);
        assert_eq!(opts.run, vec!["mmap-shuffle", "7"]);
    }
}

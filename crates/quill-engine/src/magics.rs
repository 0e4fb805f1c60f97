//! Line (`%name`) and cell (`%%name`) directives.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::directive::{CELL_MAGICS, LINE_MAGICS};
use crate::engine::{Engine, Outcome};
use crate::error::{DirectiveError, ExecError};
use crate::eval::Value;

impl Engine {
    pub(crate) fn line_magic(
        &mut self,
        name: &str,
        args: &str,
        outcome: &mut Outcome,
    ) -> Result<(), ExecError> {
        tracing::debug!("Line magic %{} {}", name, args);
        match name {
            "pwd" => outcome.stdout(format!("{}\n", self.cwd.display())),
            "cd" => {
                self.cwd = self.resolve_dir(args)?;
                outcome.stdout(format!("{}\n", self.cwd.display()));
            }
            "env" => self.env_magic(args, outcome)?,
            "who" => {
                let names = self.interp.variables();
                if names.is_empty() {
                    outcome.stdout("Interactive namespace is empty.\n");
                } else {
                    outcome.stdout(format!("{}\n", names.join("\t")));
                }
            }
            "reset" => self.interp.reset(),
            "time" => {
                if args.is_empty() {
                    return Err(DirectiveError::Usage("%time requires code to run".to_string()).into());
                }
                self.timed(args, outcome)?;
            }
            "history" => {
                let numbered = args.split_whitespace().any(|arg| arg == "-n");
                let mut listing = String::new();
                for (index, entry) in self.history.iter().enumerate() {
                    if numbered {
                        listing.push_str(&format!("{:>3}: ", index + 1));
                    }
                    listing.push_str(entry);
                    listing.push('\n');
                }
                outcome.stdout(listing);
            }
            "lsmagic" => outcome.stdout(lsmagic()),
            "echo" => outcome.stdout(format!("{}\n", args)),
            other => return Err(DirectiveError::UnknownLineMagic(other.to_string()).into()),
        }
        Ok(())
    }

    pub(crate) fn cell_magic(
        &mut self,
        name: &str,
        args: &str,
        body: &str,
        outcome: &mut Outcome,
    ) -> Result<(), ExecError> {
        tracing::debug!("Cell magic %%{} {}", name, args);
        match name {
            "bash" | "sh" => self.shell(name, body, outcome),
            "time" => self.timed(body, outcome),
            "writefile" => self.write_file(args, body, outcome),
            "capture" => {
                let mut captured = Outcome::default();
                self.dispatch(body, &mut captured)?;
                if let Some(target) = args.split_whitespace().find(|arg| !arg.starts_with('-')) {
                    let stdout: String = captured
                        .streams
                        .iter()
                        .filter(|(stream, _)| *stream == quill_core::StreamName::Stdout)
                        .map(|(_, text)| text.as_str())
                        .collect();
                    self.interp.set(target, Value::Str(stdout))?;
                }
                Ok(())
            }
            other => Err(DirectiveError::UnknownCellMagic(other.to_string()).into()),
        }
    }

    fn timed(&mut self, code: &str, outcome: &mut Outcome) -> Result<(), ExecError> {
        let started = Instant::now();
        self.dispatch(code, outcome)?;
        outcome.stdout(format!("Wall time: {}\n", format_duration(started.elapsed())));
        Ok(())
    }

    fn resolve_dir(&self, args: &str) -> Result<PathBuf, DirectiveError> {
        let home = || {
            dirs::home_dir()
                .ok_or_else(|| DirectiveError::Usage("cannot determine home directory".to_string()))
        };

        let target = match args.trim() {
            "" | "~" => home()?,
            path => match path.strip_prefix("~/") {
                Some(rest) => home()?.join(rest),
                None => self.cwd.join(path),
            },
        };

        let resolved = target
            .canonicalize()
            .map_err(|e| DirectiveError::Os(format!("{}: {}", target.display(), e)))?;
        if !resolved.is_dir() {
            return Err(DirectiveError::Os(format!(
                "not a directory: {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    fn env_magic(&mut self, args: &str, outcome: &mut Outcome) -> Result<(), ExecError> {
        let args = args.trim();

        if args.is_empty() {
            let mut vars: std::collections::BTreeMap<String, String> = std::env::vars().collect();
            vars.extend(self.env.clone());
            let listing: String = vars
                .iter()
                .map(|(key, value)| format!("{}={}\n", key, value))
                .collect();
            outcome.stdout(listing);
            return Ok(());
        }

        if let Some((key, value)) = args.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                return Err(DirectiveError::Usage("%env needs a variable name".to_string()).into());
            }
            let value = value.trim();
            self.env.insert(key.to_string(), value.to_string());
            outcome.stdout(format!("env: {}={}\n", key, value));
            return Ok(());
        }

        let value = self
            .env
            .get(args)
            .cloned()
            .or_else(|| std::env::var(args).ok())
            .ok_or_else(|| DirectiveError::Usage(format!("Environment does not have key: {}", args)))?;
        outcome.stdout(format!("{}\n", value));
        Ok(())
    }

    fn write_file(&mut self, args: &str, body: &str, outcome: &mut Outcome) -> Result<(), ExecError> {
        let mut append = false;
        let mut filename = None;
        for arg in args.split_whitespace() {
            match arg {
                "-a" | "--append" => append = true,
                flag if flag.starts_with('-') => {
                    return Err(DirectiveError::Usage(format!("unrecognized argument: {}", flag)).into());
                }
                name => filename = Some(name),
            }
        }
        let filename = filename.ok_or_else(|| {
            DirectiveError::Usage("the following arguments are required: filename".to_string())
        })?;

        let path = self.cwd.join(Path::new(filename));
        let verb = match (path.exists(), append) {
            (true, true) => "Appending to",
            (true, false) => "Overwriting",
            (false, _) => "Writing",
        };

        let mut contents = body.to_string();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }

        let os_error = |e: std::io::Error| DirectiveError::Os(format!("{}: {}", path.display(), e));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(os_error)?;
        file.write_all(contents.as_bytes()).map_err(os_error)?;

        outcome.stdout(format!("{} {}\n", verb, filename));
        Ok(())
    }
}

fn lsmagic() -> String {
    let line: Vec<String> = LINE_MAGICS.iter().map(|name| format!("%{}", name)).collect();
    let cell: Vec<String> = CELL_MAGICS.iter().map(|name| format!("%%{}", name)).collect();
    format!(
        "Available line magics:\n{}\n\nAvailable cell magics:\n{}\n",
        line.join("  "),
        cell.join("  ")
    )
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.2} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.2} ms", secs * 1e3)
    } else {
        format!("{:.0} µs", secs * 1e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptFlag;
    use quill_core::StreamName;

    fn engine_in(dir: &Path) -> Engine {
        let mut engine = Engine::new(InterruptFlag::detached());
        engine.cwd = dir.to_path_buf();
        engine
    }

    fn stdout(outcome: &Outcome) -> String {
        outcome
            .streams
            .iter()
            .filter(|(name, _)| *name == StreamName::Stdout)
            .map(|(_, text)| text.as_str())
            .collect()
    }

    #[test]
    fn test_cd_and_pwd() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        let mut engine = engine_in(temp.path());

        let outcome = engine.run("%cd sub\n%pwd");
        assert!(outcome.error.is_none());
        let expected = temp.path().join("sub").canonicalize().unwrap();
        assert_eq!(engine.cwd, expected);
        assert!(stdout(&outcome).ends_with(&format!("{}\n", expected.display())));

        let outcome = engine.run("%cd does-not-exist");
        assert!(matches!(
            outcome.error,
            Some(ExecError::Directive(DirectiveError::Os(_)))
        ));
        assert_eq!(engine.cwd, expected);
    }

    #[test]
    fn test_env_set_and_get() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());

        let outcome = engine.run("%env QUILL_MAGIC_TEST=on");
        assert_eq!(stdout(&outcome), "env: QUILL_MAGIC_TEST=on\n");
        assert_eq!(stdout(&engine.run("%env QUILL_MAGIC_TEST")), "on\n");

        let outcome = engine.run("%env QUILL_MAGIC_UNSET_FOR_SURE");
        assert!(matches!(
            outcome.error,
            Some(ExecError::Directive(DirectiveError::Usage(_)))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_env_reaches_shell() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());
        engine.run("%env GREETING=hello");
        assert_eq!(stdout(&engine.run("!echo $GREETING")), "hello\n");
    }

    #[test]
    fn test_who_and_reset() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());
        assert_eq!(stdout(&engine.run("%who")), "Interactive namespace is empty.\n");

        engine.run("b = 2\na = 1");
        assert_eq!(stdout(&engine.run("%who")), "a\tb\n");

        engine.run("%reset -f");
        assert!(engine.interp.variables().is_empty());
    }

    #[test]
    fn test_time_keeps_result() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());
        let outcome = engine.run("%time 6 * 7");
        assert_eq!(outcome.result, Some(Value::Int(42)));
        assert!(stdout(&outcome).starts_with("Wall time: "));

        let outcome = engine.run("%%time\nx = 1\nprint(x)");
        assert!(stdout(&outcome).starts_with("1\nWall time: "));
    }

    #[test]
    fn test_history_listing() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());
        engine.history = vec!["a = 1".to_string(), "%history -n".to_string()];
        assert_eq!(
            stdout(&engine.run("%history -n")),
            "  1: a = 1\n  2: %history -n\n"
        );
    }

    #[test]
    fn test_lsmagic_lists_everything() {
        let listing = lsmagic();
        for name in LINE_MAGICS {
            assert!(listing.contains(&format!("%{}", name)));
        }
        for name in CELL_MAGICS {
            assert!(listing.contains(&format!("%%{}", name)));
        }
    }

    #[test]
    fn test_writefile() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());

        let outcome = engine.run("%%writefile notes.txt\nfirst");
        assert_eq!(stdout(&outcome), "Writing notes.txt\n");
        let outcome = engine.run("%%writefile -a notes.txt\nsecond\n");
        assert_eq!(stdout(&outcome), "Appending to notes.txt\n");
        let contents = std::fs::read_to_string(temp.path().join("notes.txt")).unwrap();
        assert_eq!(contents, "first\nsecond\n");

        let outcome = engine.run("%%writefile notes.txt\nreplaced");
        assert_eq!(stdout(&outcome), "Overwriting notes.txt\n");

        let outcome = engine.run("%%writefile\nbody");
        assert!(matches!(
            outcome.error,
            Some(ExecError::Directive(DirectiveError::Usage(_)))
        ));
    }

    #[test]
    fn test_capture_discards_output() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());

        let outcome = engine.run("%%capture out\nprint('quiet')\n1 + 1");
        assert!(outcome.streams.is_empty());
        assert!(outcome.result.is_none());
        assert_eq!(engine.interp.get("out"), Some(&Value::Str("quiet\n".to_string())));

        let outcome = engine.run("%%capture\n1/0");
        assert!(outcome.error.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_cell_and_escape() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut engine = engine_in(temp.path());

        let outcome = engine.run("%%bash\necho one\necho two >&2");
        assert_eq!(
            outcome.streams,
            vec![
                (StreamName::Stdout, "one\n".to_string()),
                (StreamName::Stderr, "two\n".to_string()),
            ]
        );

        let outcome = engine.run("!echo escaped\nx = 3\nx");
        assert_eq!(stdout(&outcome), "escaped\n");
        assert_eq!(outcome.result, Some(Value::Int(3)));
    }
}

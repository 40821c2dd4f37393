//! Decides which session a plain `monomux` invocation should end up in.

use std::io::{BufRead, Write};

use crate::ipc::message::SessionInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Attach(String),
    Create(String),
    /// Nothing to do (list-only run, or the user quit the menu).
    None,
}

/// The non-interactive rules, mimicking tmux-style defaults:
/// empty server and no name → create the default; exactly one session and
/// no name → attach to it; a name → attach if present, create otherwise.
/// Returns `None` when only the menu can decide.
fn select_noninteractive(sessions: &[SessionInfo], requested: &str) -> Selection {
    if sessions.is_empty() {
        return Selection::Create(requested.to_string());
    }
    if requested.is_empty() && sessions.len() == 1 {
        return Selection::Attach(sessions[0].name.clone());
    }
    if !requested.is_empty() {
        if sessions.iter().any(|s| s.name == requested) {
            return Selection::Attach(requested.to_string());
        }
        return Selection::Create(requested.to_string());
    }
    Selection::None
}

pub fn format_session_line(index: usize, session: &SessionInfo) -> String {
    format!(
        "    {}. {} (created {}, {} attached)",
        index + 1,
        session.name,
        session.created_at,
        session.attached_count
    )
}

/// Full selection flow over arbitrary input/output streams. `list_only`
/// prints the table and stops; `interactive` forces the menu even when the
/// non-interactive rules could decide.
pub fn select_session<R: BufRead, W: Write>(
    socket_label: &str,
    default_program: &str,
    sessions: &[SessionInfo],
    requested: &str,
    list_only: bool,
    interactive: bool,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<Selection> {
    if !(list_only || interactive) {
        let choice = select_noninteractive(sessions, requested);
        if choice != Selection::None {
            return Ok(choice);
        }
    }

    let new_choice = sessions.len() + 1;
    let quit_choice = new_choice + 1;

    loop {
        writeln!(output, "\nMonomux sessions on '{socket_label}'...\n")?;
        for (i, s) in sessions.iter().enumerate() {
            writeln!(output, "{}", format_session_line(i, s))?;
        }
        if list_only {
            writeln!(output)?;
            return Ok(Selection::None);
        }

        if requested.is_empty() {
            writeln!(output, "    {new_choice}. Create a new session ({default_program})")?;
        } else {
            writeln!(
                output,
                "    {new_choice}. Create a new '{requested}' session ({default_program})"
            )?;
        }
        writeln!(output, "    {quit_choice}. Quit")?;
        write!(output, "\nChoose 1-{quit_choice}: ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(Selection::None);
        }
        let choice: usize = match line.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                writeln!(output, "\nERROR: Invalid input")?;
                continue;
            }
        };
        if choice == 0 || choice > quit_choice {
            writeln!(output, "\nERROR: Invalid input")?;
            continue;
        }

        if choice == quit_choice {
            return Ok(Selection::None);
        }
        if choice == new_choice {
            if !requested.is_empty() {
                return Ok(Selection::Create(requested.to_string()));
            }
            write!(output, "\nSession name (leave blank for default): ")?;
            output.flush()?;
            let mut name = String::new();
            input.read_line(&mut name)?;
            return Ok(Selection::Create(name.trim().to_string()));
        }
        return Ok(Selection::Attach(sessions[choice - 1].name.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> SessionInfo {
        SessionInfo {
            name: name.into(),
            created_at: 0,
            attached_count: 0,
        }
    }

    #[test]
    fn empty_server_creates_requested() {
        assert_eq!(
            select_noninteractive(&[], "work"),
            Selection::Create("work".into())
        );
        assert_eq!(select_noninteractive(&[], ""), Selection::Create("".into()));
    }

    #[test]
    fn single_session_attaches_without_name() {
        let sessions = vec![session("only")];
        assert_eq!(
            select_noninteractive(&sessions, ""),
            Selection::Attach("only".into())
        );
    }

    #[test]
    fn named_session_attaches_if_present_creates_otherwise() {
        let sessions = vec![session("a"), session("b")];
        assert_eq!(
            select_noninteractive(&sessions, "a"),
            Selection::Attach("a".into())
        );
        assert_eq!(
            select_noninteractive(&sessions, "c"),
            Selection::Create("c".into())
        );
    }

    #[test]
    fn many_sessions_without_name_defers_to_menu() {
        let sessions = vec![session("a"), session("b")];
        assert_eq!(select_noninteractive(&sessions, ""), Selection::None);
    }

    #[test]
    fn menu_attach_by_number() {
        let sessions = vec![session("a"), session("b")];
        let mut input = std::io::Cursor::new(b"2\n".to_vec());
        let mut output = Vec::new();
        let sel = select_session(
            "/tmp/x.sock",
            "/bin/sh",
            &sessions,
            "",
            false,
            true,
            &mut input,
            &mut output,
        )
        .unwrap();
        assert_eq!(sel, Selection::Attach("b".into()));
    }

    #[test]
    fn menu_create_prompts_for_name() {
        let sessions = vec![session("a"), session("b")];
        let mut input = std::io::Cursor::new(b"3\nfresh\n".to_vec());
        let mut output = Vec::new();
        let sel = select_session(
            "/tmp/x.sock",
            "/bin/sh",
            &sessions,
            "",
            false,
            true,
            &mut input,
            &mut output,
        )
        .unwrap();
        assert_eq!(sel, Selection::Create("fresh".into()));
    }

    #[test]
    fn menu_quit_and_garbage_handling() {
        let sessions = vec![session("a")];
        let mut input = std::io::Cursor::new(b"nope\n99\n3\n".to_vec());
        let mut output = Vec::new();
        let sel = select_session(
            "/tmp/x.sock",
            "/bin/sh",
            &sessions,
            "",
            false,
            true,
            &mut input,
            &mut output,
        )
        .unwrap();
        assert_eq!(sel, Selection::None);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("ERROR: Invalid input"));
    }

    #[test]
    fn list_only_prints_and_stops() {
        let sessions = vec![session("a")];
        let mut input = std::io::Cursor::new(Vec::new());
        let mut output = Vec::new();
        let sel = select_session(
            "/tmp/x.sock",
            "/bin/sh",
            &sessions,
            "",
            true,
            false,
            &mut input,
            &mut output,
        )
        .unwrap();
        assert_eq!(sel, Selection::None);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("1. a"));
    }
}

// ABOUTME: Terminal capability detection for graphics protocol selection
// ABOUTME: Inspects TERM/TERM_PROGRAM and friends, with a force-protocol override

use std::env;

/// Wire protocols the renderer can emit. Absence of all of them means the
/// half-block (or plain text) fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsProtocol {
    Kitty,
    Iterm2,
    Sixel,
}

impl GraphicsProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kitty => "kitty",
            Self::Iterm2 => "iterm2",
            Self::Sixel => "sixel",
        }
    }
}

/// What the current terminal can display, derived from environment
/// variables once at startup.
#[derive(Debug, Clone)]
pub struct TerminalCapabilities {
    pub supports_kitty: bool,
    pub supports_iterm2: bool,
    pub supports_sixel: bool,
    pub terminal_name: String,
}

impl TerminalCapabilities {
    /// Detect from the process environment. `BLOBVIEW_FORCE_PROTOCOL`
    /// overrides detection entirely; an unrecognized value falls back to
    /// normal detection with a warning.
    pub fn detect() -> Self {
        if let Ok(forced) = env::var("BLOBVIEW_FORCE_PROTOCOL") {
            if let Some(caps) = Self::from_forced(&forced) {
                return caps;
            }
            log::warn!(
                "unknown protocol '{forced}' in BLOBVIEW_FORCE_PROTOCOL; valid values: kitty, iterm2, sixel, none"
            );
        }

        let term = env::var("TERM").unwrap_or_default();
        let term_program = env::var("TERM_PROGRAM").unwrap_or_default();
        let kitty_window = env::var("KITTY_WINDOW_ID").is_ok();
        let wezterm = env::var("WEZTERM_EXECUTABLE").is_ok();
        let ghostty = env::var("GHOSTTY_RESOURCES_DIR").is_ok();

        Self::from_environment(&term, &term_program, kitty_window, wezterm, ghostty)
    }

    /// Pure detection logic, separated from environment reads so it can be
    /// tested without touching process state.
    pub fn from_environment(
        term: &str,
        term_program: &str,
        kitty_window: bool,
        wezterm: bool,
        ghostty: bool,
    ) -> Self {
        let supports_kitty = kitty_window
            || wezterm
            || ghostty
            || matches!(term_program, "kitty" | "WezTerm" | "ghostty")
            || term.contains("kitty")
            || term.contains("ghostty");

        let supports_iterm2 = term_program == "iTerm.app"
            || matches!(term_program, "WezTerm" | "mintty" | "Hyper" | "Warp" | "Tabby")
            || term.contains("iterm");

        let supports_sixel = term.contains("sixel")
            || matches!(term_program, "mlterm" | "foot")
            || term.starts_with("mlterm")
            || term.starts_with("yaft")
            || term.starts_with("foot");

        let terminal_name = if !term_program.is_empty() {
            term_program.to_string()
        } else if !term.is_empty() {
            term.to_string()
        } else {
            "unknown".to_string()
        };

        Self {
            supports_kitty,
            supports_iterm2,
            supports_sixel,
            terminal_name,
        }
    }

    fn from_forced(protocol: &str) -> Option<Self> {
        let terminal_name = format!("forced-{}", protocol.to_lowercase());
        let caps = match protocol.to_lowercase().as_str() {
            "kitty" => Self {
                supports_kitty: true,
                supports_iterm2: false,
                supports_sixel: false,
                terminal_name,
            },
            "iterm2" => Self {
                supports_kitty: false,
                supports_iterm2: true,
                supports_sixel: false,
                terminal_name,
            },
            "sixel" => Self {
                supports_kitty: false,
                supports_iterm2: false,
                supports_sixel: true,
                terminal_name,
            },
            "none" | "disable" | "disabled" => Self {
                supports_kitty: false,
                supports_iterm2: false,
                supports_sixel: false,
                terminal_name,
            },
            _ => return None,
        };
        Some(caps)
    }

    pub fn supports_inline_images(&self) -> bool {
        self.supports_kitty || self.supports_iterm2 || self.supports_sixel
    }

    /// Best available protocol, in preference order. Kitty first: it has
    /// the richest placement control and explicit clearing.
    pub fn preferred_protocol(&self) -> Option<GraphicsProtocol> {
        if self.supports_kitty {
            Some(GraphicsProtocol::Kitty)
        } else if self.supports_iterm2 {
            Some(GraphicsProtocol::Iterm2)
        } else if self.supports_sixel {
            Some(GraphicsProtocol::Sixel)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Restores an environment variable to its prior value on drop.
    struct EnvGuard {
        name: &'static str,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(name: &'static str, value: Option<&str>) -> Self {
            let original = env::var(name).ok();
            unsafe {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
            Self { name, original }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe {
                match &self.original {
                    Some(v) => env::set_var(self.name, v),
                    None => env::remove_var(self.name),
                }
            }
        }
    }

    #[test]
    fn test_kitty_terminal_detection() {
        let caps = TerminalCapabilities::from_environment("xterm-kitty", "kitty", true, false, false);
        assert!(caps.supports_kitty);
        assert_eq!(caps.preferred_protocol(), Some(GraphicsProtocol::Kitty));

        // KITTY_WINDOW_ID alone is enough.
        let caps = TerminalCapabilities::from_environment("xterm-256color", "", true, false, false);
        assert!(caps.supports_kitty);
    }

    #[test]
    fn test_wezterm_supports_both_and_prefers_kitty() {
        let caps =
            TerminalCapabilities::from_environment("xterm-256color", "WezTerm", false, true, false);
        assert!(caps.supports_kitty);
        assert!(caps.supports_iterm2);
        assert_eq!(caps.preferred_protocol(), Some(GraphicsProtocol::Kitty));
    }

    #[test]
    fn test_ghostty_uses_kitty_protocol() {
        let caps =
            TerminalCapabilities::from_environment("xterm-ghostty", "ghostty", false, false, true);
        assert!(caps.supports_kitty);
        assert_eq!(caps.preferred_protocol(), Some(GraphicsProtocol::Kitty));
    }

    #[test]
    fn test_iterm2_detection() {
        let caps = TerminalCapabilities::from_environment(
            "xterm-256color",
            "iTerm.app",
            false,
            false,
            false,
        );
        assert!(caps.supports_iterm2);
        assert!(!caps.supports_kitty);
        assert_eq!(caps.preferred_protocol(), Some(GraphicsProtocol::Iterm2));
        assert_eq!(caps.terminal_name, "iTerm.app");
    }

    #[test]
    fn test_sixel_terminals() {
        for term in ["xterm-sixel", "mlterm", "yaft-256color", "foot"] {
            let caps = TerminalCapabilities::from_environment(term, "", false, false, false);
            assert!(caps.supports_sixel, "expected sixel support for {term}");
            assert_eq!(caps.preferred_protocol(), Some(GraphicsProtocol::Sixel));
        }
    }

    #[test]
    fn test_dumb_terminal_has_no_protocol() {
        let caps = TerminalCapabilities::from_environment("dumb", "", false, false, false);
        assert!(!caps.supports_inline_images());
        assert_eq!(caps.preferred_protocol(), None);
        assert_eq!(caps.terminal_name, "dumb");
    }

    #[test]
    #[serial]
    fn test_force_protocol_overrides_detection() {
        let _force = EnvGuard::set("BLOBVIEW_FORCE_PROTOCOL", Some("sixel"));
        let _term = EnvGuard::set("TERM", Some("xterm-kitty"));
        let _program = EnvGuard::set("TERM_PROGRAM", Some("kitty"));

        let caps = TerminalCapabilities::detect();
        assert!(caps.supports_sixel);
        assert!(!caps.supports_kitty);
        assert_eq!(caps.terminal_name, "forced-sixel");
    }

    #[test]
    #[serial]
    fn test_force_protocol_none_disables_graphics() {
        let _force = EnvGuard::set("BLOBVIEW_FORCE_PROTOCOL", Some("none"));
        let _term = EnvGuard::set("TERM", Some("xterm-kitty"));
        let _window = EnvGuard::set("KITTY_WINDOW_ID", Some("1"));

        let caps = TerminalCapabilities::detect();
        assert!(!caps.supports_inline_images());
        assert_eq!(caps.preferred_protocol(), None);
        assert_eq!(caps.terminal_name, "forced-none");
    }

    #[test]
    #[serial]
    fn test_unknown_forced_protocol_falls_back_to_detection() {
        let _force = EnvGuard::set("BLOBVIEW_FORCE_PROTOCOL", Some("webgl"));
        let _term = EnvGuard::set("TERM", Some("xterm-kitty"));
        let _program = EnvGuard::set("TERM_PROGRAM", Some("kitty"));
        let _window = EnvGuard::set("KITTY_WINDOW_ID", None);
        let _wez = EnvGuard::set("WEZTERM_EXECUTABLE", None);
        let _ghostty = EnvGuard::set("GHOSTTY_RESOURCES_DIR", None);

        let caps = TerminalCapabilities::detect();
        assert!(caps.supports_kitty);
    }
}

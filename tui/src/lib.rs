//! Raw-mode terminal shell for interactive Obi sessions: a bounded log pane,
//! a hotkey router, and the display driver that ties them to session events.

mod display;
mod input;
mod logpane;
mod shell;

pub use display::DisplayOptions;
pub use display::SessionDisplay;
pub use display::TuiError;
pub use input::InputMode;
pub use input::InputRouter;
pub use input::SOFT_STOP_REASON_DEFAULT;
pub use input::SessionControls;
pub use shell::Shell;
pub use shell::StatusLine;
pub use shell::TokenUsage;

use crate::errors::LocateError;

/// Synthetic input delivered to the driven application.
pub trait InputInjector: Send + Sync {
    fn click(&self, x: i32, y: i32) -> Result<(), LocateError>;

    fn type_text(&self, text: &str) -> Result<(), LocateError>;

    /// Sends a key sequence such as `ctrl+s` or `alt,f,x`.
    fn send_keys(&self, sequence: &str) -> Result<(), LocateError>;
}

/// Restarts the driven application when its window disappears.
pub trait TargetRestarter: Send + Sync {
    fn restart_target(&self) -> Result<(), LocateError>;
}

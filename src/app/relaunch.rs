//! Process relaunch for graceful restart

use std::env;
use std::process::Command;

use tracing::info;

use crate::common::Result;

/// Start a new instance of the running executable with the same arguments.
///
/// The child inherits the environment and standard streams. Returns its pid.
pub fn relaunch() -> Result<u32> {
    let exe = env::current_exe()?;
    let args: Vec<_> = env::args_os().skip(1).collect();

    let child = Command::new(&exe).args(&args).spawn()?;
    info!("Relaunched {} as pid {}", exe.display(), child.id());

    Ok(child.id())
}

//! The first user program.

use log::{debug, info, warn};

use kern::{UserAddr, UserContext};

/// Reaps every child handed to the calling process, forever. Without
/// children it naps a tick between attempts.
pub fn reap_forever(u: &mut UserContext<'_>) -> ! {
    loop {
        match u.wait(None) {
            Ok(pid) => debug!("init: reaped pid {pid}"),
            Err(_) => {
                let _ = u.sleep(1);
            }
        }
    }
}

/// Body of init: starts `main` in a child process and then reaps orphans.
pub fn init_main(u: &mut UserContext<'_>, main: UserAddr) -> ! {
    match u.fork(main) {
        Ok(pid) => info!("init: started main as pid {pid}"),
        Err(err) => warn!("init: cannot start main: {err}"),
    }
    reap_forever(u)
}

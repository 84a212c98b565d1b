// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture and board support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each backend must define the same set of names:
//!
//! - `SavedState`, implementing `task::ArchState`
//! - `HaltMode`
//! - `now`, `enable_irq`, `disable_irq`
//! - `board_halt`, `board_hm_exception`, `board_tp_switch`
//! - `send_ipi`, `alarm_callback`
//! - `reinitialize`, `switch_to`
//! - the `uassert!`, `uassert_eq!` and `klog!` macros

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    } else {
        compile_error!("board support for this target is not part of this tree");
    }
}

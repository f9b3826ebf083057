// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Puts `memory.x` where the `cortex-m-rt` linker script can find it, and
//! rebuilds when it changes.

use std::env;
use std::fs;
use std::path::PathBuf;

const MEMORY_LAYOUT: &str = "memory.x";

fn main() {
    let out = PathBuf::from(env::var_os("OUT_DIR").expect("cargo sets OUT_DIR"));
    fs::copy(MEMORY_LAYOUT, out.join(MEMORY_LAYOUT)).expect("copying memory.x");
    println!("cargo:rustc-link-search={}", out.display());

    println!("cargo:rerun-if-changed={}", MEMORY_LAYOUT);
    println!("cargo:rerun-if-changed=build.rs");
}

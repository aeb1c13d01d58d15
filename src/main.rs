//! # io-wizard CLI
//!
//! Command-line driver for the image load wizard.
//!
//! ## Usage
//! ```bash
//! io-wizard inspect scan.png
//! io-wizard register main.png overlay.png --metric mean-squares
//! io-wizard register main.png overlay.png --output json
//! ```

mod cli;

use image_load_wizard::Result;

fn main() -> Result<()> {
    image_load_wizard::init_tracing();
    cli::run()
}

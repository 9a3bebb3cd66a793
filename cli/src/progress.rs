use std::io::{self, Write};

use dfu::{Phase, Progress};

const BAR_WIDTH: usize = 60;

/// `#` progress bar on stdout
#[derive(Default)]
pub(crate) struct ProgressBar {
    label: &'static str,
    total: usize,
}

impl Progress for ProgressBar {
    fn start(&mut self, phase: Phase, total: usize) {
        self.label = match phase {
            Phase::Erase => "Erasing ",
            Phase::Download => "Flashing",
            Phase::Upload => "Reading ",
        };
        self.total = total;
        self.update(0);
    }

    fn update(&mut self, done: usize) {
        if self.total == 0 {
            print!("\r  {} {done} bytes", self.label);
        } else {
            let done = done.min(self.total);
            let percentage = (100 * done) / self.total;
            let filled = (BAR_WIDTH * done) / self.total;
            print!(
                "\r  {} {:3}% [{}]",
                self.label,
                percentage,
                "#".repeat(filled) + &" ".repeat(BAR_WIDTH - filled)
            );
        }
        let _ = io::stdout().flush();
    }

    fn finish(&mut self) {
        println!();
    }
}

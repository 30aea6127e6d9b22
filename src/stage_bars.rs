use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::profile::{SearchStage, StageStatus};

const BAR_LENGTH: u64 = 100;

/// Terminal rendering of the live stage list, one bar per stage in
/// first-seen order.
pub struct StageBars {
    multi: MultiProgress,
    bars: Vec<(String, ProgressBar)>,
    style: ProgressStyle,
}

impl StageBars {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template("{prefix:>12.bold} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        Self {
            multi: MultiProgress::new(),
            bars: vec![],
            style,
        }
    }

    pub fn render(&mut self, stages: &[SearchStage]) {
        for stage in stages {
            let bar = match self.bars.iter().find(|(name, _)| *name == stage.name) {
                Some((_, bar)) => bar.clone(),
                None => {
                    let bar = self.multi.add(ProgressBar::new(BAR_LENGTH));
                    bar.set_style(self.style.clone());
                    bar.set_prefix(stage.name.clone());
                    self.bars.push((stage.name.clone(), bar.clone()));
                    bar
                }
            };

            bar.set_position(percent(stage.progress));
            let message = match (&stage.status, &stage.message) {
                (StageStatus::Running, Some(message)) => message.clone(),
                (StageStatus::Running, None) => String::new(),
                (status, Some(message)) => format!("{status}: {message}"),
                (status, None) => status.to_string(),
            };
            bar.set_message(message);
        }
    }

    pub fn finish(self) {
        for (_, bar) in self.bars {
            bar.finish_and_clear();
        }
    }
}

/// Stage progress arrives either as a 0..1 fraction or as a percentage.
fn percent(progress: f64) -> u64 {
    let pct = if progress <= 1.0 {
        progress * 100.0
    } else {
        progress
    };
    pct.clamp(0.0, BAR_LENGTH as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0.0), 0);
        assert_eq!(percent(0.45), 45);
        assert_eq!(percent(1.0), 100);
        assert_eq!(percent(60.0), 60);
        assert_eq!(percent(250.0), 100);
        assert_eq!(percent(-3.0), 0);
    }
}

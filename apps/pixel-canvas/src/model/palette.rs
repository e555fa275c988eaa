use super::Color;
use parking_lot::RwLock;
use std::sync::Arc;

const DEFAULT_COLORS: [Color; 12] = [
    Color::rgb(0x00, 0x00, 0x00),
    Color::rgb(0xFF, 0xFF, 0xFF),
    Color::rgb(0xFF, 0x00, 0x00),
    Color::rgb(0x00, 0xFF, 0x00),
    Color::rgb(0x00, 0x00, 0xFF),
    Color::rgb(0xFF, 0xFF, 0x00),
    Color::rgb(0xFF, 0x00, 0xFF),
    Color::rgb(0x00, 0xFF, 0xFF),
    Color::rgb(0x88, 0x88, 0x88),
    Color::rgb(0xFF, 0xA5, 0x00),
    Color::rgb(0x80, 0x00, 0x80),
    Color::rgb(0xFF, 0xC0, 0xCB),
];

/// Colors offered by the picker. The first entry is the initial selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Color>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: DEFAULT_COLORS.to_vec(),
        }
    }
}

impl Palette {
    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    pub fn initial(&self) -> Color {
        self.colors.first().copied().unwrap_or(Color::BLACK)
    }

    pub fn contains(&self, color: Color) -> bool {
        self.colors.contains(&color)
    }
}

/// Currently selected drawing color, shared between the UI and the input controller.
#[derive(Clone, Debug)]
pub struct SharedSelection {
    inner: Arc<RwLock<Color>>,
}

impl SharedSelection {
    pub fn new(initial: Color) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> Color {
        *self.inner.read()
    }

    pub fn set(&self, color: Color) {
        *self.inner.write() = color;
    }
}

impl Default for SharedSelection {
    fn default() -> Self {
        Self::new(Palette::default().initial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_palette_starts_black() {
        let palette = Palette::default();
        assert_eq!(palette.colors().len(), 12);
        assert_eq!(palette.initial(), Color::BLACK);
        assert!(palette.contains(Color::parse("#FFC0CB").unwrap()));
        assert_eq!(SharedSelection::default().get(), Color::BLACK);
    }
}

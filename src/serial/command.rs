use std::fmt;

/// One controller command. The wire form is a newline-terminated ASCII line
/// rendered by the `Display` impl; the terminator is added by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pixel {
        index: usize,
        red: u8,
        green: u8,
        blue: u8,
    },
    All {
        red: u8,
        green: u8,
        blue: u8,
    },
    Clear,
    Brightness(u8),
    Blink {
        index: usize,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::Pixel {
                index,
                red,
                green,
                blue,
            } => write!(f, "PIXEL:{},{},{},{}", index, red, green, blue),
            Command::All { red, green, blue } => write!(f, "ALL:{},{},{}", red, green, blue),
            Command::Clear => write!(f, "CLEAR:"),
            Command::Brightness(value) => write!(f, "BRIGHT:{}", value),
            Command::Blink { index } => write!(f, "BLINK:{}", index),
        }
    }
}

/// How a command is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Write, then wait for one response line (bounded by the ack timeout).
    Ack,
    /// Write, flush and pace with a fixed delay instead of waiting. Used for
    /// high-rate pixel draws.
    FireAndForget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encoding() {
        assert_eq!(
            Command::Pixel {
                index: 0,
                red: 255,
                green: 0,
                blue: 0
            }
            .to_string(),
            "PIXEL:0,255,0,0"
        );
        assert_eq!(
            Command::All {
                red: 100,
                green: 100,
                blue: 100
            }
            .to_string(),
            "ALL:100,100,100"
        );
        assert_eq!(Command::Clear.to_string(), "CLEAR:");
        assert_eq!(Command::Brightness(128).to_string(), "BRIGHT:128");
        assert_eq!(Command::Blink { index: 42 }.to_string(), "BLINK:42");
    }
}

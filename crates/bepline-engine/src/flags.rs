//! The options a build was invoked with, read from its event stream.

use bepline_stream::{Event, StreamError};

/// Options the user passed explicitly, as reported by `optionsParsed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFlags {
    pub startup_options: Vec<String>,
    pub cmd_line: Vec<String>,
}

/// Read the explicit startup and command-line options of the build.
///
/// The first `optionsParsed` event wins. A stream without one yields empty
/// flags.
///
/// # Errors
/// Returns the first error the stream yields before the options are found.
pub fn parse_build_flags<I>(events: I) -> Result<BuildFlags, StreamError>
where
    I: IntoIterator<Item = Result<Event, StreamError>>,
{
    for event in events {
        if let Event::OptionsParsed(options) = event? {
            return Ok(BuildFlags {
                startup_options: options.explicit_startup_options,
                cmd_line: options.explicit_cmd_line,
            });
        }
    }
    tracing::debug!("no options event in stream");
    Ok(BuildFlags::default())
}

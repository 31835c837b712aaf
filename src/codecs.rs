/// Framed packets, resynchronising after bad frames.
pub mod framed;

/// Command lines.
pub mod lines;

/// Unframed passthrough, one packet per read.
pub mod raw;

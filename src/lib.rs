//! Forum gallery ripper: scans posts for hosted images and downloads them

pub mod ripper;

mod archive_tests;
mod fixtures;

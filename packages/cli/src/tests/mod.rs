// ABOUTME: Unit tests for the skiff-cli library
// ABOUTME: Grouped by module under test

mod helpers;

mod flush_tests;

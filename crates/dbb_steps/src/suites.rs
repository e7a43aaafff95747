//! The test suites a device tester knows how to run.

/// An instrumentation test suite: an APK under test plus the test APK exercising it.
#[derive(Debug, PartialEq, Eq)]
pub struct InstrumentationSuite {
    pub name: &'static str,
    /// APK to install before testing.
    pub apk: &'static str,
    pub apk_package: &'static str,
    /// Test APK, without the `.apk` extension.
    pub test_apk: &'static str,
    /// Test data, as `destination:source`.
    pub test_data: &'static str,
    /// Host-driven test root, relative to the source root.
    pub host_driven_root: Option<&'static str>,
    pub annotation: Option<&'static str>,
    pub exclude_annotation: Option<&'static str>,
    pub extra_flags: &'static [&'static str],
}

impl InstrumentationSuite {
    const fn new(
        name: &'static str,
        apk: &'static str,
        apk_package: &'static str,
        test_apk: &'static str,
        test_data: &'static str,
    ) -> Self {
        Self {
            name,
            apk,
            apk_package,
            test_apk,
            test_data,
            host_driven_root: None,
            annotation: None,
            exclude_annotation: None,
            extra_flags: &[],
        }
    }

    const fn with_host_driven_root(mut self, root: &'static str) -> Self {
        self.host_driven_root = Some(root);
        self
    }
}

pub const CHROMIUM_TEST_SHELL_HOST_DRIVEN_DIR: &str = "chrome/android";

pub const INSTRUMENTATION_SUITES: &[InstrumentationSuite] = &[
    InstrumentationSuite::new(
        "ContentShell",
        "ContentShell.apk",
        "org.chromium.content_shell_apk",
        "ContentShellTest",
        "content:content/test/data/android/device_files",
    ),
    InstrumentationSuite::new(
        "ChromiumTestShell",
        "ChromiumTestShell.apk",
        "org.chromium.chrome.testshell",
        "ChromiumTestShellTest",
        "chrome:chrome/test/data/android/device_files",
    )
    .with_host_driven_root(CHROMIUM_TEST_SHELL_HOST_DRIVEN_DIR),
    InstrumentationSuite::new(
        "AndroidWebView",
        "AndroidWebView.apk",
        "org.chromium.android_webview.shell",
        "AndroidWebViewTest",
        "webview:android_webview/test/data/device_files",
    ),
];

pub fn instrumentation_suite(name: &str) -> Option<&'static InstrumentationSuite> {
    INSTRUMENTATION_SUITES.iter().find(|suite| suite.name == name)
}

pub const CHROMIUM_TEST_SHELL_PACKAGE: &str = "org.chromium.chrome.testshell";
pub const CHROME_STABLE_PACKAGE: &str = "com.android.chrome";
pub const CHROME_BETA_PACKAGE: &str = "com.chrome.beta";

pub const STABLE_TEST_SUITES: &[&str] = &[
    "android_webview_unittests",
    "base_unittests",
    "breakpad_unittests",
    "cc_unittests",
    "components_unittests",
    "content_browsertests",
    "content_unittests",
    "gpu_unittests",
    "ipc_tests",
    "media_unittests",
    "net_unittests",
    "sandbox_linux_unittests",
    "sql_unittests",
    "sync_unit_tests",
    "ui_unittests",
    "unit_tests",
    "webkit_compositor_bindings_unittests",
    "webkit_unit_tests",
];

pub const WEBRTC_TEST_SUITES: &[&str] = &[
    "audio_decoder_unittests",
    "common_audio_unittests",
    "common_video_unittests",
    "metrics_unittests",
    "modules_integrationtests",
    "modules_unittests",
    "system_wrappers_unittests",
    "test_support_unittests",
    "tools_unittests",
    "video_engine_core_unittests",
    "voice_engine_unittests",
];

pub const EXPERIMENTAL_TEST_SUITES: &[&str] = &["content_gl_tests"];

/// Suites known to be flaky enough to deserve a retry.
pub fn gtest_retries(suite: &str) -> Option<u32> {
    (suite == "content_browsertests").then_some(1)
}

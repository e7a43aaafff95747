//! Resolution of Java test filters to concrete test methods.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_derive::Deserialize;

use crate::InstrumentationError;

/// The Java tests an instrumentation package contains.
#[async_trait]
pub trait TestPackage: Send {
    /// Resolves the tests to run, as `package.Class#method` ids in a stable order.
    ///
    /// `annotations`, when given, keeps only tests carrying at least one of them;
    /// `exclude_annotations` drops tests carrying any of them.
    async fn matching_tests(
        &mut self,
        annotations: Option<&[String]>,
        exclude_annotations: Option<&[String]>,
        test_filter: Option<&str>,
    ) -> Result<Vec<String>, InstrumentationError>;
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ListedTest {
    pub class: String,
    pub method: String,
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl ListedTest {
    pub fn test_id(&self) -> String {
        format!("{}#{}", self.class, self.method)
    }

    fn has_any_annotation(&self, annotations: &[String]) -> bool {
        self.annotations.iter().any(|a| annotations.contains(a))
    }
}

/// A [TestPackage] over the JSON test listing generated alongside the test JAR.
/// The listing is read lazily, once.
#[derive(Debug)]
pub struct ListedTestPackage {
    listing_path: PathBuf,
    tests: Option<Vec<ListedTest>>,
}

impl ListedTestPackage {
    pub fn new(listing_path: impl Into<PathBuf>) -> Self {
        Self {
            listing_path: listing_path.into(),
            tests: None,
        }
    }

    pub fn listing_path(&self) -> &Path {
        &self.listing_path
    }

    async fn tests(&mut self) -> Result<&[ListedTest], InstrumentationError> {
        if self.tests.is_none() {
            let raw = tokio::fs::read(&self.listing_path).await.map_err(|source| {
                InstrumentationError::ReadListing {
                    path: self.listing_path.clone(),
                    source,
                }
            })?;
            let tests: Vec<ListedTest> = serde_json::from_slice(&raw).map_err(|source| {
                InstrumentationError::MalformedListing {
                    path: self.listing_path.clone(),
                    source,
                }
            })?;
            tracing::debug!(path = %self.listing_path.display(), num_tests = tests.len(), "loaded test listing");
            self.tests = Some(tests);
        }
        Ok(self.tests.as_deref().unwrap_or_default())
    }
}

#[async_trait]
impl TestPackage for ListedTestPackage {
    async fn matching_tests(
        &mut self,
        annotations: Option<&[String]>,
        exclude_annotations: Option<&[String]>,
        test_filter: Option<&str>,
    ) -> Result<Vec<String>, InstrumentationError> {
        let filter = test_filter.map(TestFilter::parse).transpose()?;
        let tests = self.tests().await?;

        let matching = tests
            .iter()
            .filter(|t| match annotations {
                Some(wanted) if !wanted.is_empty() => t.has_any_annotation(wanted),
                _ => true,
            })
            .filter(|t| match exclude_annotations {
                Some(excluded) => !t.has_any_annotation(excluded),
                None => true,
            })
            .filter(|t| filter.as_ref().map_or(true, |f| f.matches(t)))
            .map(ListedTest::test_id)
            .collect();

        Ok(matching)
    }
}

/// A `package.Class#method` pattern where `*` matches any run of characters. Without a `#`,
/// every method of the matching classes is selected.
#[derive(Debug)]
pub struct TestFilter {
    class: Regex,
    method: Option<Regex>,
}

impl TestFilter {
    pub fn parse(filter: &str) -> Result<Self, InstrumentationError> {
        let compile = |pattern: &str| {
            Regex::new(&glob_to_regex(pattern)).map_err(|source| {
                InstrumentationError::InvalidFilter {
                    filter: filter.to_owned(),
                    source,
                }
            })
        };

        match filter.split_once('#') {
            Some((class, method)) => Ok(Self {
                class: compile(class)?,
                method: Some(compile(method)?),
            }),
            None => Ok(Self {
                class: compile(filter)?,
                method: None,
            }),
        }
    }

    pub fn matches(&self, test: &ListedTest) -> bool {
        self.class.is_match(&test.class)
            && self
                .method
                .as_ref()
                .map_or(true, |method| method.is_match(&test.method))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let parts: Vec<_> = glob.split('*').map(regex::escape).collect();
    format!("^{}$", parts.join(".*"))
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use indoc::indoc;
    use tempfile::NamedTempFile;

    use super::{ListedTestPackage, TestPackage};
    use crate::InstrumentationError;

    const LISTING: &str = indoc! {r#"
        [
          {"class": "org.chromium.content.browser.ContentViewTest", "method": "testScroll", "annotations": ["SmallTest"]},
          {"class": "org.chromium.content.browser.ContentViewTest", "method": "testZoom", "annotations": ["MediumTest", "FlakyTest"]},
          {"class": "org.chromium.content.browser.NavigationTest", "method": "testBack", "annotations": ["SmallTest"]},
          {"class": "org.chromium.chrome.testshell.ProviderTest", "method": "testBookmarks"}
        ]
    "#};

    fn listing() -> (NamedTempFile, ListedTestPackage) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(LISTING.as_bytes()).unwrap();
        let package = ListedTestPackage::new(file.path());
        (file, package)
    }

    async fn matching(package: &mut ListedTestPackage, filter: &str) -> Vec<String> {
        package.matching_tests(None, None, Some(filter)).await.unwrap()
    }

    #[tokio::test]
    async fn exact_method() {
        let (_file, mut package) = listing();
        assert_eq!(
            matching(&mut package, "org.chromium.content.browser.ContentViewTest#testZoom").await,
            ["org.chromium.content.browser.ContentViewTest#testZoom"]
        );
    }

    #[tokio::test]
    async fn class_without_method_selects_every_method() {
        let (_file, mut package) = listing();
        assert_eq!(
            matching(&mut package, "org.chromium.content.browser.ContentViewTest").await,
            [
                "org.chromium.content.browser.ContentViewTest#testScroll",
                "org.chromium.content.browser.ContentViewTest#testZoom",
            ]
        );
    }

    #[tokio::test]
    async fn wildcards_keep_listing_order() {
        let (_file, mut package) = listing();
        assert_eq!(
            matching(&mut package, "org.chromium.content.*#test*").await,
            [
                "org.chromium.content.browser.ContentViewTest#testScroll",
                "org.chromium.content.browser.ContentViewTest#testZoom",
                "org.chromium.content.browser.NavigationTest#testBack",
            ]
        );
        assert_eq!(
            matching(&mut package, "*#testB*").await,
            [
                "org.chromium.content.browser.NavigationTest#testBack",
                "org.chromium.chrome.testshell.ProviderTest#testBookmarks",
            ]
        );
    }

    #[tokio::test]
    async fn dots_are_literal() {
        let (_file, mut package) = listing();
        assert!(matching(&mut package, "org.chromium.content.browserXContentViewTest")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn no_match_is_empty_not_an_error() {
        let (_file, mut package) = listing();
        assert!(matching(&mut package, "org.chromium.Nope#testNothing")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn annotations_include_and_exclude() {
        let (_file, mut package) = listing();
        let small = vec!["SmallTest".to_owned(), "MediumTest".to_owned()];
        let flaky = vec!["FlakyTest".to_owned()];

        let tests = package
            .matching_tests(Some(&small), Some(&flaky), None)
            .await
            .unwrap();
        assert_eq!(
            tests,
            [
                "org.chromium.content.browser.ContentViewTest#testScroll",
                "org.chromium.content.browser.NavigationTest#testBack",
            ]
        );

        let all = package.matching_tests(None, None, None).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn missing_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut package = ListedTestPackage::new(dir.path().join("absent.tests.json"));
        let err = package.matching_tests(None, None, None).await.unwrap_err();
        assert!(matches!(err, InstrumentationError::ReadListing { .. }));
    }

    #[tokio::test]
    async fn malformed_listing() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{\"class\": 1}").unwrap();
        let mut package = ListedTestPackage::new(file.path());
        let err = package.matching_tests(None, None, None).await.unwrap_err();
        assert!(matches!(err, InstrumentationError::MalformedListing { .. }));
    }
}
